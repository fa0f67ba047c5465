//! Source Assets
//!
//! Host-side data handed to the renderer's `load` operations. Decoding from
//! files happens elsewhere; these types only carry decoded data.
//!
//! Assets are shared as `Arc<T>`. The renderer deduplicates loads by the
//! identity of the `Arc` allocation (see [`SourceId`]) and keeps a clone of
//! every loaded source so the identity cannot be recycled.

use std::borrow::Cow;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rustc_hash::FxHashMap;

use crate::errors::{RenderError, Result};
use crate::gpu::SamplerDesc;

/// Identity of a shared source asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

impl SourceId {
    #[must_use]
    pub fn of<T>(asset: &Arc<T>) -> Self {
        Self(Arc::as_ptr(asset).cast::<()>() as usize)
    }
}

// ============================================================================
// Mesh
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 3],
    pub tangent: [f32; 4],
}

impl Vertex {
    #[must_use]
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            color: [1.0; 3],
            tangent: [1.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    #[must_use]
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// The one-triangle mesh used when an object has no geometry.
    #[must_use]
    pub fn default_triangle() -> Self {
        let n = [0.0, 0.0, 1.0];
        Self::new(
            vec![
                Vertex::new([-0.5, -0.5, 0.0], n, [0.0, 1.0]),
                Vertex::new([0.5, -0.5, 0.0], n, [1.0, 1.0]),
                Vertex::new([0.0, 0.5, 0.0], n, [0.5, 0.0]),
            ],
            vec![0, 1, 2],
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }
}

// ============================================================================
// Image
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8,
    Rg8,
    /// Expanded to RGBA8 on upload.
    Rgb8,
    Rgba8,
    Rgba16Float,
    Rgba32Float,
}

impl ImageFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::R8 => 1,
            Self::Rg8 => 2,
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    #[default]
    Srgb,
    Linear,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub color_space: ColorSpace,
    pub pixels: Vec<u8>,
}

impl Image {
    #[must_use]
    pub fn new(width: u32, height: u32, format: ImageFormat, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            color_space: ColorSpace::Srgb,
            pixels,
        }
    }

    #[must_use]
    pub fn linear(mut self) -> Self {
        self.color_space = ColorSpace::Linear;
        self
    }

    /// Single-color RGBA8 image.
    #[must_use]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::new(width, height, ImageFormat::Rgba8, pixels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::InvalidAsset(format!(
                "image has zero extent {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.pixels.len() != expected {
            return Err(RenderError::InvalidAsset(format!(
                "image {}x{} {:?} expects {expected} bytes, got {}",
                self.width,
                self.height,
                self.format,
                self.pixels.len()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn texture_format(&self) -> wgpu::TextureFormat {
        let srgb = self.color_space == ColorSpace::Srgb;
        match self.format {
            ImageFormat::R8 => wgpu::TextureFormat::R8Unorm,
            ImageFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
            ImageFormat::Rgb8 | ImageFormat::Rgba8 if srgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            ImageFormat::Rgb8 | ImageFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    /// Pixel bytes in the layout of [`texture_format`](Self::texture_format).
    #[must_use]
    pub fn upload_bytes(&self) -> Cow<'_, [u8]> {
        match self.format {
            ImageFormat::Rgb8 => Cow::Owned(
                self.pixels
                    .chunks_exact(3)
                    .flat_map(|p| [p[0], p[1], p[2], 255])
                    .collect(),
            ),
            _ => Cow::Borrowed(&self.pixels),
        }
    }
}

/// Sampling parameters attached to a texture reference.
pub type ImageSampler = SamplerDesc;

/// Filter choice for UI images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

impl SamplerFilter {
    #[must_use]
    pub fn sampler_desc(self) -> SamplerDesc {
        let filter = match self {
            Self::Nearest => wgpu::FilterMode::Nearest,
            Self::Linear => wgpu::FilterMode::Linear,
        };
        SamplerDesc {
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: match self {
                Self::Nearest => wgpu::MipmapFilterMode::Nearest,
                Self::Linear => wgpu::MipmapFilterMode::Linear,
            },
            address_mode: [wgpu::AddressMode::ClampToEdge; 3],
            ..Default::default()
        }
    }
}

// ============================================================================
// Material
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TextureRef {
    /// `None` binds the slot's default texture.
    pub image: Option<Arc<Image>>,
    pub sampler: ImageSampler,
}

impl TextureRef {
    #[must_use]
    pub fn new(image: Arc<Image>) -> Self {
        Self {
            image: Some(image),
            sampler: ImageSampler::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Material {
    pub diffuse: TextureRef,
    pub normal: TextureRef,
    pub metalness: TextureRef,
    pub roughness: TextureRef,
    pub occlusion: TextureRef,
    pub emissive: TextureRef,
    pub emissive_factor: f32,
    pub alpha_cutoff: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: TextureRef::default(),
            normal: TextureRef::default(),
            metalness: TextureRef::default(),
            roughness: TextureRef::default(),
            occlusion: TextureRef::default(),
            emissive: TextureRef::default(),
            emissive_factor: 0.0,
            alpha_cutoff: 0.5,
        }
    }
}

// ============================================================================
// Font
// ============================================================================

/// Placement of one glyph, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Glyph {
    /// Offset of the glyph's top-left corner from the pen position.
    pub offset: Vec2,
    pub size: Vec2,
    pub advance: f32,
    pub uv_min: Vec2,
    pub uv_max: Vec2,
}

#[derive(Debug, Clone)]
pub struct Font {
    /// Single-channel coverage atlas.
    pub atlas: Arc<Image>,
    pub glyphs: FxHashMap<char, Glyph>,
    pub line_height: f32,
}

impl Font {
    #[must_use]
    pub fn new(atlas: Arc<Image>, glyphs: FxHashMap<char, Glyph>, line_height: f32) -> Self {
        Self {
            atlas,
            glyphs,
            line_height,
        }
    }

    #[must_use]
    pub fn glyph(&self, c: char) -> Option<&Glyph> {
        self.glyphs.get(&c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_expands_to_rgba() {
        let image = Image::new(2, 1, ImageFormat::Rgb8, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(image.upload_bytes().as_ref(), &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(image.texture_format(), wgpu::TextureFormat::Rgba8UnormSrgb);
    }

    #[test]
    fn size_mismatch_is_invalid() {
        let image = Image::new(4, 4, ImageFormat::Rgba8, vec![0; 15]);
        assert!(matches!(image.validate(), Err(RenderError::InvalidAsset(_))));
    }

    #[test]
    fn source_identity_follows_allocation() {
        let a = Arc::new(Mesh::default_triangle());
        let b = Arc::new(Mesh::default_triangle());
        assert_eq!(SourceId::of(&a), SourceId::of(&a.clone()));
        assert_ne!(SourceId::of(&a), SourceId::of(&b));
    }
}
