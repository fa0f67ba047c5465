//! Frames in flight.
//!
//! - [`FrameSlot`]: per-frame recorder, synchronization and buffers
//! - [`FrameScheduler`]: slot rotation, output acquisition and presentation

pub mod scheduler;
pub mod slot;

pub use scheduler::{ActiveFrame, FrameEnd, FrameScheduler, FrameStart, OutputTarget};
pub use slot::{CameraUniforms, DirtyFlags, FrameSlot, SlotBuffers};
