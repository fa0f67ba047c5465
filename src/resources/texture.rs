//! Texture Registry
//!
//! Owns every uploaded image, the sampler cache, and the bindless texture
//! array. A bindless entry is an `(image, sampler key)` pair; equal pairs
//! share one index. Indices `0..DEFAULT_TEXTURE_COUNT` always hold the
//! default textures, so materials can fall back to them.

use std::sync::Arc;

use log::{debug, info};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::assets::{Image, ImageFormat, SourceId, TextureRef};
use crate::errors::{RenderError, Result};
use crate::gpu::{
    GpuDevice, ImageDesc, ImageHandle, ImageUpload, SamplerDesc, SamplerHandle, Uploader,
    mip_level_count,
};

/// Alias for the key of `SamplerDesc::default()`, the sampler shared by the
/// default textures.
pub const DEFAULT_SAMPLER_KEY: &str = "defaultSampler";

fn canonical_sampler_key(key: &str) -> String {
    if key == DEFAULT_SAMPLER_KEY {
        SamplerDesc::default().sampler_key()
    } else {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DefaultTexture {
    Diffuse = 0,
    Normal = 1,
    Metalness = 2,
    Roughness = 3,
    Occlusion = 4,
    Emissive = 5,
}

pub const DEFAULT_TEXTURE_COUNT: u32 = 6;

impl DefaultTexture {
    #[must_use]
    pub fn index(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub image: ImageHandle,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: wgpu::TextureFormat,
}

/// Result of adding an entry to the bindless array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInsert {
    pub index: u32,
    /// `false` when an equal entry already existed.
    pub inserted: bool,
}

#[derive(Debug, Clone)]
struct TextureEntry {
    image: ImageId,
    sampler: SamplerHandle,
}

pub struct TextureRegistry {
    images: Vec<LoadedImage>,
    by_source: FxHashMap<SourceId, ImageId>,
    sources: Vec<Arc<Image>>,
    samplers: FxHashMap<String, SamplerHandle>,
    textures: Vec<TextureEntry>,
    lookup: FxHashMap<(ImageId, String), u32>,
    capacity: u32,
}

/// 16×16 gradient shown where a diffuse texture is missing.
fn procedural_diffuse() -> Image {
    let pixels = (0..=255u8)
        .flat_map(|i| [255 - i, i % 128, i, 255])
        .collect();
    Image::new(16, 16, ImageFormat::Rgba8, pixels)
}

impl TextureRegistry {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            images: Vec::new(),
            by_source: FxHashMap::default(),
            sources: Vec::new(),
            samplers: FxHashMap::default(),
            textures: Vec::new(),
            lookup: FxHashMap::default(),
            capacity,
        }
    }

    /// Uploads the default textures into bindless slots `0..6`.
    pub fn create_defaults<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
    ) -> Result<()> {
        let sampler_key = self.sampler(device, &SamplerDesc::default())?;

        let defaults = [
            procedural_diffuse(),
            Image::solid(1, 1, [127, 127, 255, 255]).linear(),
            Image::solid(1, 1, [0, 0, 0, 255]).linear(),
            Image::solid(1, 1, [0, 0, 0, 255]).linear(),
            Image::solid(1, 1, [255, 255, 255, 255]).linear(),
            Image::solid(1, 1, [0, 0, 0, 255]),
        ];
        for (slot, image) in defaults.into_iter().enumerate() {
            let id = self.load_image(device, uploader, &Arc::new(image), true)?;
            let insert = self.add_texture(id, &sampler_key)?;
            debug_assert_eq!(insert.index, slot as u32);
        }
        info!("Created {DEFAULT_TEXTURE_COUNT} default textures");
        Ok(())
    }

    /// Uploads an image (optionally with a full mip chain), deduplicated by
    /// source identity.
    pub fn load_image<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        image: &Arc<Image>,
        mipmapped: bool,
    ) -> Result<ImageId> {
        let source = SourceId::of(image);
        if let Some(&id) = self.by_source.get(&source) {
            return Ok(id);
        }
        image.validate()?;

        let mip_levels = if mipmapped {
            mip_level_count(image.width, image.height)
        } else {
            1
        };
        let format = image.texture_format();
        let handle = device.create_image(&ImageDesc {
            label: "Texture",
            width: image.width,
            height: image.height,
            layers: 1,
            mip_levels,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
        })?;
        uploader.upload_image(
            device,
            ImageUpload {
                image: handle,
                width: image.width,
                height: image.height,
                mip_levels,
            },
            &image.upload_bytes(),
        )?;

        let id = ImageId(self.images.len() as u32);
        self.images.push(LoadedImage {
            image: handle,
            width: image.width,
            height: image.height,
            mip_levels,
            format,
        });
        self.by_source.insert(source, id);
        self.sources.push(image.clone());
        debug!(
            "Loaded image {id:?}: {}x{} {format:?}, {mip_levels} mips",
            image.width, image.height
        );
        Ok(id)
    }

    /// Returns the cache key of a sampler, creating the sampler on first use.
    pub fn sampler<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        desc: &SamplerDesc,
    ) -> Result<String> {
        let key = desc.sampler_key();
        if !self.samplers.contains_key(&key) {
            let sampler = device.create_sampler(desc)?;
            debug!("Created sampler '{key}'");
            self.samplers.insert(key.clone(), sampler);
        }
        Ok(key)
    }

    #[must_use]
    pub fn sampler_handle(&self, key: &str) -> Option<SamplerHandle> {
        self.samplers.get(&canonical_sampler_key(key)).copied()
    }

    /// Adds an `(image, sampler)` pair to the bindless array.
    pub fn add_texture(&mut self, image: ImageId, sampler_key: &str) -> Result<TextureInsert> {
        let lookup_key = (image, canonical_sampler_key(sampler_key));
        if let Some(&index) = self.lookup.get(&lookup_key) {
            return Ok(TextureInsert {
                index,
                inserted: false,
            });
        }
        if self.get(image).is_none() {
            return Err(RenderError::UnknownResource {
                kind: "image",
                index: image.0,
            });
        }
        let sampler = self.sampler_handle(sampler_key).ok_or_else(|| {
            RenderError::InvalidAsset(format!("sampler '{sampler_key}' was never created"))
        })?;
        if self.textures.len() as u32 >= self.capacity {
            return Err(RenderError::CapacityExceeded {
                resource: "bindless textures",
                capacity: self.capacity as usize,
            });
        }
        let index = self.textures.len() as u32;
        self.textures.push(TextureEntry { image, sampler });
        self.lookup.insert(lookup_key, index);
        Ok(TextureInsert {
            index,
            inserted: true,
        })
    }

    /// Resolves a material texture slot. A missing image selects `fallback`.
    pub fn resolve<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        texture: &TextureRef,
        fallback: DefaultTexture,
    ) -> Result<TextureInsert> {
        let Some(image) = &texture.image else {
            return Ok(TextureInsert {
                index: fallback.index(),
                inserted: false,
            });
        };
        let id = self.load_image(device, uploader, image, true)?;
        let key = self.sampler(device, &texture.sampler)?;
        self.add_texture(id, &key)
    }

    #[must_use]
    pub fn get(&self, id: ImageId) -> Option<&LoadedImage> {
        self.images.get(id.0 as usize)
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    /// Populated part of the bindless array, ready for a binding write.
    #[must_use]
    pub fn bindless_arrays(
        &self,
    ) -> (SmallVec<[ImageHandle; 4]>, SmallVec<[SamplerHandle; 4]>) {
        let images = self
            .textures
            .iter()
            .map(|t| self.images[t.image.0 as usize].image)
            .collect();
        let samplers = self.textures.iter().map(|t| t.sampler).collect();
        (images, samplers)
    }

    /// Releases samplers, then images.
    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for (_, sampler) in self.samplers {
            device.destroy_sampler(sampler)?;
        }
        for image in self.images {
            device.destroy_image(image.image)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn setup() -> (HeadlessDevice, Uploader, TextureRegistry) {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut registry = TextureRegistry::new(64);
        registry.create_defaults(&mut device, &mut uploader).unwrap();
        (device, uploader, registry)
    }

    #[test]
    fn defaults_fill_first_slots() {
        let (_, _, registry) = setup();
        assert_eq!(registry.texture_count(), DEFAULT_TEXTURE_COUNT as usize);
        assert_eq!(registry.sampler_count(), 1);
        let diffuse = registry.get(ImageId(0)).unwrap();
        assert_eq!((diffuse.width, diffuse.height, diffuse.mip_levels), (16, 16, 5));
    }

    #[test]
    fn missing_image_uses_fallback() {
        let (mut device, mut uploader, mut registry) = setup();
        let insert = registry
            .resolve(
                &mut device,
                &mut uploader,
                &TextureRef::default(),
                DefaultTexture::Normal,
            )
            .unwrap();
        assert_eq!(insert.index, 1);
        assert!(!insert.inserted);
    }

    #[test]
    fn equal_pairs_share_an_index() {
        let (mut device, mut uploader, mut registry) = setup();
        let image = Arc::new(Image::solid(4, 4, [1, 2, 3, 255]));
        let a = registry
            .resolve(&mut device, &mut uploader, &TextureRef::new(image.clone()), DefaultTexture::Diffuse)
            .unwrap();
        let b = registry
            .resolve(&mut device, &mut uploader, &TextureRef::new(image), DefaultTexture::Diffuse)
            .unwrap();
        assert!(a.inserted);
        assert_eq!(b, TextureInsert { index: a.index, inserted: false });
        assert_eq!(registry.sampler_count(), 1);
    }

    #[test]
    fn default_parameters_reuse_the_default_sampler() {
        let (mut device, mut uploader, mut registry) = setup();
        let key = SamplerDesc::default().sampler_key();
        assert_eq!(
            registry.sampler_handle(DEFAULT_SAMPLER_KEY),
            registry.sampler_handle(&key)
        );

        let image = Arc::new(Image::solid(4, 4, [9, 9, 9, 255]));
        registry
            .resolve(&mut device, &mut uploader, &TextureRef::new(image), DefaultTexture::Diffuse)
            .unwrap();
        assert_eq!(registry.sampler_count(), 1);

        // the alias and the structural key name the same bindless pair
        let insert = registry.add_texture(ImageId(0), &key).unwrap();
        assert_eq!(insert, TextureInsert { index: 0, inserted: false });
        let insert = registry.add_texture(ImageId(0), DEFAULT_SAMPLER_KEY).unwrap();
        assert_eq!(insert, TextureInsert { index: 0, inserted: false });
    }

    #[test]
    fn capacity_is_enforced() {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut registry = TextureRegistry::new(DEFAULT_TEXTURE_COUNT);
        registry.create_defaults(&mut device, &mut uploader).unwrap();
        let image = Arc::new(Image::solid(2, 2, [0; 4]));
        let err = registry
            .resolve(&mut device, &mut uploader, &TextureRef::new(image), DefaultTexture::Diffuse)
            .unwrap_err();
        assert!(matches!(err, RenderError::CapacityExceeded { .. }));
    }
}
