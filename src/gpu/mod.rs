//! GPU Abstraction Layer
//!
//! The frame core records [`Command`]s against generational handles and
//! submits them through the [`GpuDevice`] trait:
//!
//! - [`HeadlessDevice`]: in-memory device that validates the barrier protocol
//! - `WgpuDevice` (feature `wgpu_backend`): the real GPU through wgpu
//!
//! Supporting pieces:
//! - [`ShaderCompiler`]: embedded WGSL templates rendered with minijinja
//! - [`Uploader`]: blocking staged uploads and mip generation

pub mod command;
pub mod device;
pub mod headless;
pub mod shader;
pub mod staging;
pub mod types;

#[cfg(feature = "wgpu_backend")]
pub mod wgpu_device;

pub use command::{Command, CommandList, CommandRecorder, PushConstants};
pub use device::{GpuDevice, ShaderSource, SubmitInfo};
pub use headless::{HeadlessDevice, SubmissionRecord};
pub use shader::ShaderCompiler;
pub use staging::{ImageUpload, Uploader, mip_level_count};
pub use types::*;

#[cfg(feature = "wgpu_backend")]
pub use wgpu_device::WgpuDevice;
