//! Frame passes.
//!
//! Each pass is a [`RenderNode`]: `prepare` rewrites whatever binding tables
//! of the current slot are dirty, `run` appends the pass's commands. Passes
//! run in a fixed order on one recorder:
//!
//! ```text
//! shadow → main → tone mapping → ui
//! ```

pub mod main_pass;
pub mod targets;
pub mod tone_mapping;
pub mod ui;

pub use main_pass::MainPass;
pub use targets::RenderTargets;
pub use tone_mapping::ToneMapPass;
pub use ui::{FontId, UiCompositor, UiPrimitiveKind};

use crate::errors::Result;
use crate::frame::{DirtyFlags, SlotBuffers};
use crate::gpu::{CommandRecorder, Extent, GpuDevice, ImageHandle};
use crate::resources::{GeometryArena, MeshRange, TextureRegistry};
use crate::shadow::ShadowBindings;

/// Draw of one live object: its slot in the object buffer and its mesh range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDraw {
    pub object: u32,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

impl ObjectDraw {
    #[must_use]
    pub fn new(object: u32, range: MeshRange) -> Self {
        Self {
            object,
            index_count: range.index_count,
            first_index: range.first_index,
            vertex_offset: range.vertex_offset,
        }
    }
}

/// Everything a pass reads while preparing and recording one frame.
pub struct FrameContext<'a> {
    /// Index of the frame slot being recorded.
    pub slot: usize,
    pub buffers: &'a SlotBuffers,
    pub geometry: &'a GeometryArena,
    pub textures: &'a TextureRegistry,
    /// Live objects in slot order.
    pub draws: &'a [ObjectDraw],
    pub shadows: &'a ShadowBindings,
    pub dummy_shadow_map: ImageHandle,
    pub targets: &'a RenderTargets,
    pub output: ImageHandle,
    pub output_extent: Extent,
}

pub trait RenderNode {
    fn name(&self) -> &'static str;

    /// Brings the slot's binding tables up to date. Clears the dirty flags it
    /// handled.
    fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FrameContext<'_>,
        dirty: &mut DirtyFlags,
    ) -> Result<()>;

    fn run(&self, frame: &FrameContext<'_>, recorder: &mut CommandRecorder);
}
