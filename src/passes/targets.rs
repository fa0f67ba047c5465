//! HDR color and depth targets of the main pass.
//!
//! Both follow the draw extent and are rebuilt by the resize path.

use log::debug;

use crate::errors::Result;
use crate::gpu::{Extent, GpuDevice, ImageDesc, ImageHandle};

#[derive(Debug, Clone, Copy)]
pub struct RenderTargets {
    pub color: ImageHandle,
    pub depth: ImageHandle,
    pub extent: Extent,
    pub color_format: wgpu::TextureFormat,
    pub depth_format: wgpu::TextureFormat,
}

impl RenderTargets {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        extent: Extent,
        color_format: wgpu::TextureFormat,
        depth_format: wgpu::TextureFormat,
    ) -> Result<Self> {
        let color = device.create_image(&ImageDesc {
            label: "HDR Color Target",
            width: extent.width,
            height: extent.height,
            layers: 1,
            mip_levels: 1,
            format: color_format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        })?;
        let depth = device.create_image(&ImageDesc {
            label: "Depth Target",
            width: extent.width,
            height: extent.height,
            layers: 1,
            mip_levels: 1,
            format: depth_format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        })?;
        debug!(
            "Created render targets {}x{} ({color_format:?}, {depth_format:?})",
            extent.width, extent.height
        );
        Ok(Self {
            color,
            depth,
            extent,
            color_format,
            depth_format,
        })
    }

    /// Replaces both targets with new ones of `extent`.
    pub fn recreate<D: GpuDevice + ?Sized>(&mut self, device: &mut D, extent: Extent) -> Result<()> {
        let fresh = Self::new(device, extent, self.color_format, self.depth_format)?;
        let old = std::mem::replace(self, fresh);
        old.destroy(device)
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.destroy_image(self.color)?;
        device.destroy_image(self.depth)
    }
}
