//! Frame slots.
//!
//! A slot is one frame in flight: its own recorder, fence, semaphores, and a
//! private copy of every per-frame buffer. The slot's fence guards all of it;
//! nothing in a slot is touched by the host until that fence has signalled.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::errors::Result;
use crate::gpu::{BufferDesc, BufferHandle, CommandRecorder, FenceHandle, GpuDevice, SemaphoreHandle};
use crate::passes::ui::GPU_GLYPH_SIZE;
use crate::resources::lights::{GPU_LIGHT_SIZE, LIGHT_HEADER_SIZE};
use crate::resources::{GpuMaterial, GpuObject};
use crate::settings::{RendererSettings, SHADOW_CASCADE_COUNT};
use crate::shadow::{CASCADE_RECORD_SIZE, SHADOW_MATRIX_SIZE};

bitflags! {
    /// Binding tables of a slot that must be rewritten before its next use.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFlags: u32 {
        const MAIN_BINDINGS     = 1 << 0;
        const SHADOW_BINDINGS   = 1 << 1;
        const TONE_MAP_BINDINGS = 1 << 2;
        const UI_TEXT_BINDINGS  = 1 << 3;
        const UI_IMAGE_BINDINGS = 1 << 4;
    }
}

/// Camera record: view, projection, world position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl CameraUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    #[must_use]
    pub fn new(view: Mat4, projection: Mat4, position: Vec3) -> Self {
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            position: position.extend(1.0).to_array(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlotBuffers {
    pub camera: BufferHandle,
    pub objects: BufferHandle,
    pub materials: BufferHandle,
    pub lights: BufferHandle,
    /// Matrix-only records read by the depth pass.
    pub shadow_matrices: BufferHandle,
    /// `{viewProj, splitDepth}` records read by the lighting pass.
    pub cascades: BufferHandle,
    pub ui_text: BufferHandle,
}

impl SlotBuffers {
    fn create<D: GpuDevice + ?Sized>(device: &mut D, settings: &RendererSettings) -> Result<Self> {
        let shadow_matrices =
            u64::from(settings.max_shadow_maps) * SHADOW_CASCADE_COUNT as u64;
        let mut storage = |label: &str, size: u64| {
            device.create_buffer(&BufferDesc {
                label,
                size: size.max(16),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                host_visible: true,
            })
        };
        Ok(Self {
            objects: storage(
                "Object Buffer",
                u64::from(settings.max_objects) * GpuObject::SIZE,
            )?,
            materials: storage(
                "Material Buffer",
                u64::from(settings.max_materials) * std::mem::size_of::<GpuMaterial>() as u64,
            )?,
            lights: storage(
                "Light Buffer",
                LIGHT_HEADER_SIZE + u64::from(settings.max_lights) * GPU_LIGHT_SIZE,
            )?,
            shadow_matrices: storage("Shadow Matrix Buffer", shadow_matrices * SHADOW_MATRIX_SIZE)?,
            cascades: storage("Cascade Buffer", shadow_matrices * CASCADE_RECORD_SIZE)?,
            ui_text: storage(
                "UI Text Buffer",
                u64::from(settings.max_ui_glyphs) * GPU_GLYPH_SIZE,
            )?,
            camera: device.create_buffer(&BufferDesc {
                label: "Camera Buffer",
                size: CameraUniforms::SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                host_visible: true,
            })?,
        })
    }

    fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for buffer in [
            self.camera,
            self.objects,
            self.materials,
            self.lights,
            self.shadow_matrices,
            self.cascades,
            self.ui_text,
        ] {
            device.destroy_buffer(buffer)?;
        }
        Ok(())
    }
}

pub struct FrameSlot {
    pub index: usize,
    pub recorder: CommandRecorder,
    pub fence: FenceHandle,
    pub acquire_semaphore: SemaphoreHandle,
    pub present_semaphore: SemaphoreHandle,
    pub buffers: SlotBuffers,
    pub dirty: DirtyFlags,
}

impl FrameSlot {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        index: usize,
        settings: &RendererSettings,
    ) -> Result<Self> {
        Ok(Self {
            index,
            recorder: CommandRecorder::new("Frame"),
            // signalled so the first wait passes
            fence: device.create_fence(true)?,
            acquire_semaphore: device.create_semaphore()?,
            present_semaphore: device.create_semaphore()?,
            buffers: SlotBuffers::create(device, settings)?,
            dirty: DirtyFlags::all(),
        })
    }

    pub fn destroy_sync<D: GpuDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        device.destroy_fence(self.fence)?;
        device.destroy_semaphore(self.acquire_semaphore)?;
        device.destroy_semaphore(self.present_semaphore)
    }

    pub fn destroy_buffers<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        self.buffers.destroy(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_record_is_two_matrices_and_a_vector() {
        assert_eq!(CameraUniforms::SIZE, 144);
    }
}
