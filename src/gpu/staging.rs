//! Blocking staged uploads.
//!
//! Every upload goes through a temporary host-visible staging buffer, one
//! command list and a fence wait, so the data is resident when the call
//! returns. Uploads happen outside the per-frame pipeline.

use log::debug;

use super::command::CommandRecorder;
use super::device::{GpuDevice, SubmitInfo};
use super::types::{BufferDesc, BufferHandle, FenceHandle, ImageBarrier, ImageHandle, ImageLayout};
use crate::errors::Result;

/// Full mip chain length for an image: `floor(log2(min(w, h))) + 1`.
#[inline]
#[must_use]
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    width.min(height).max(1).ilog2() + 1
}

/// Destination image of an upload.
#[derive(Debug, Clone, Copy)]
pub struct ImageUpload {
    pub image: ImageHandle,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
}

pub struct Uploader {
    fence: FenceHandle,
    recorder: CommandRecorder,
}

impl Uploader {
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D) -> Result<Self> {
        Ok(Self {
            fence: device.create_fence(false)?,
            recorder: CommandRecorder::new("Upload"),
        })
    }

    fn submit_and_wait<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        let list = self.recorder.finish();
        device.submit(
            list,
            &SubmitInfo {
                fence: Some(self.fence),
                ..Default::default()
            },
        )?;
        device.wait_fence(self.fence)?;
        device.reset_fence(self.fence)
    }

    fn staging<D: GpuDevice + ?Sized>(device: &mut D, data: &[u8]) -> Result<BufferHandle> {
        let staging = device.create_buffer(&BufferDesc {
            label: "Staging Buffer",
            size: data.len() as u64,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::MAP_WRITE,
            host_visible: true,
        })?;
        device.write_buffer(staging, 0, data)?;
        Ok(staging)
    }

    /// Copies `data` into a device-local buffer at `offset`.
    pub fn upload_buffer<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        dst: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let staging = Self::staging(device, data)?;
        self.recorder
            .copy_buffer(staging, 0, dst, offset, data.len() as u64);
        let result = self.submit_and_wait(device);
        device.destroy_buffer(staging)?;
        debug!("Uploaded {} bytes", data.len());
        result
    }

    /// Device-to-device copy, waited on synchronously.
    pub fn copy_buffer<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> Result<()> {
        self.recorder.copy_buffer(src, 0, dst, 0, size);
        self.submit_and_wait(device)
    }

    /// Uploads mip 0 and generates the remaining mips by successive
    /// half-resolution blits. Leaves every mip in `ShaderReadOnly`.
    pub fn upload_image<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        target: ImageUpload,
        data: &[u8],
    ) -> Result<()> {
        let staging = Self::staging(device, data)?;
        let image = target.image;
        let levels = target.mip_levels.max(1);

        self.recorder.barrier(
            ImageBarrier::whole(image, ImageLayout::Undefined, ImageLayout::TransferDst)
                .mips(0, levels),
        );
        self.recorder
            .copy_buffer_to_image(staging, 0, image, 0, target.width, target.height);
        for mip in 0..levels - 1 {
            self.recorder.barrier(
                ImageBarrier::whole(image, ImageLayout::TransferDst, ImageLayout::TransferSrc)
                    .mips(mip, 1),
            );
            self.recorder.blit_mip(image, mip);
            self.recorder.barrier(
                ImageBarrier::whole(image, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly)
                    .mips(mip, 1),
            );
        }
        self.recorder.barrier(
            ImageBarrier::whole(image, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)
                .mips(levels - 1, 1),
        );

        let result = self.submit_and_wait(device);
        device.destroy_buffer(staging)?;
        debug!(
            "Uploaded image {}x{} ({levels} mips)",
            target.width, target.height
        );
        result
    }

    /// Records `barriers` alone and waits for them.
    pub fn transition<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        barriers: &[ImageBarrier],
    ) -> Result<()> {
        for barrier in barriers {
            self.recorder.barrier(*barrier);
        }
        self.submit_and_wait(device)
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.destroy_fence(self.fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_follows_shorter_edge() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(16, 16), 5);
        assert_eq!(mip_level_count(256, 64), 7);
        assert_eq!(mip_level_count(100, 300), 7);
        assert_eq!(mip_level_count(0, 8), 1);
    }
}
