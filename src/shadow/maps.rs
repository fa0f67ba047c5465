//! Shadow-map ownership.
//!
//! Directional and spot lights own a layered depth image, created when the
//! light is added. A removed light's image is retired rather than destroyed:
//! it is released once every frame slot has waited on its fence since the
//! removal, so frames already submitted keep a valid target.

use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::Result;
use crate::gpu::{GpuDevice, ImageBarrier, ImageDesc, ImageHandle, ImageLayout, Uploader};
use crate::resources::LightSets;
use crate::scene::{Entity, LightKind};
use crate::settings::SHADOW_CASCADE_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMap {
    pub image: ImageHandle,
    pub layers: u32,
    pub kind: LightKind,
}

#[derive(Debug)]
struct RetiredMap {
    map: ShadowMap,
    /// Frames begun when the owning light was removed.
    retired_at: u64,
}

/// Maps bound for one frame, in shader index order.
#[derive(Debug, Clone, Default)]
pub struct ShadowBindings {
    pub directional: Vec<(Entity, ShadowMap)>,
    pub spot: Vec<(Entity, ShadowMap)>,
}

impl ShadowBindings {
    /// Shader array index of a light's map: directional first, then spot.
    #[must_use]
    pub fn index_of(&self, entity: Entity) -> Option<u32> {
        self.directional
            .iter()
            .chain(&self.spot)
            .position(|(e, _)| *e == entity)
            .map(|i| i as u32)
    }

    #[must_use]
    pub fn images(&self) -> SmallVec<[ImageHandle; 4]> {
        self.directional
            .iter()
            .chain(&self.spot)
            .map(|(_, m)| m.image)
            .collect()
    }
}

pub struct ShadowMaps {
    maps: FxHashMap<Entity, ShadowMap>,
    retired: Vec<RetiredMap>,
    /// 1×1 map bound when no light casts shadows.
    dummy: ShadowMap,
    resolution: u32,
    format: wgpu::TextureFormat,
    capacity: u32,
}

fn create_map<D: GpuDevice + ?Sized>(
    device: &mut D,
    uploader: &mut Uploader,
    label: &str,
    size: u32,
    layers: u32,
    format: wgpu::TextureFormat,
) -> Result<ImageHandle> {
    let image = device.create_image(&ImageDesc {
        label,
        width: size,
        height: size,
        layers,
        mip_levels: 1,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
    })?;
    uploader.transition(
        device,
        &[ImageBarrier::layers(
            image,
            layers,
            ImageLayout::Undefined,
            ImageLayout::ShaderReadOnly,
        )],
    )?;
    Ok(image)
}

impl ShadowMaps {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        uploader: &mut Uploader,
        resolution: u32,
        format: wgpu::TextureFormat,
        capacity: u32,
    ) -> Result<Self> {
        let image = create_map(device, uploader, "Dummy Shadow Map", 1, 1, format)?;
        Ok(Self {
            maps: FxHashMap::default(),
            retired: Vec::new(),
            dummy: ShadowMap {
                image,
                layers: 1,
                kind: LightKind::Spot,
            },
            resolution,
            format,
            capacity,
        })
    }

    #[must_use]
    pub fn layers_for(kind: LightKind) -> u32 {
        match kind {
            LightKind::Directional => SHADOW_CASCADE_COUNT as u32,
            _ => 1,
        }
    }

    /// Creates the map for a shadow-casting light if it has none of the
    /// right kind. Returns `true` when a map was created.
    pub fn ensure<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        entity: Entity,
        kind: LightKind,
        frames_begun: u64,
    ) -> Result<bool> {
        if kind == LightKind::Point {
            return Ok(false);
        }
        match self.maps.get(&entity) {
            Some(map) if map.kind == kind => return Ok(false),
            Some(_) => self.retire(entity, frames_begun),
            None => {}
        }
        if self.maps.len() as u32 >= self.capacity {
            warn!(
                "Shadow map limit ({}) reached; light {entity} casts no shadow",
                self.capacity
            );
            return Ok(false);
        }

        let layers = Self::layers_for(kind);
        let label = match kind {
            LightKind::Directional => "Directional Shadow Map",
            _ => "Spot Shadow Map",
        };
        let image = create_map(device, uploader, label, self.resolution, layers, self.format)?;
        self.maps.insert(entity, ShadowMap { image, layers, kind });
        info!(
            "Created {layers}-layer shadow map ({0}x{0}) for light {entity}",
            self.resolution
        );
        Ok(true)
    }

    /// Removes a light's map from use; the image outlives in-flight frames.
    pub fn retire(&mut self, entity: Entity, frames_begun: u64) {
        if let Some(map) = self.maps.remove(&entity) {
            debug!("Retired shadow map of light {entity}");
            self.retired.push(RetiredMap {
                map,
                retired_at: frames_begun,
            });
        }
    }

    /// Destroys retired maps no submitted frame can still reference.
    /// Call after waiting on the fence of frame `frame_index`.
    pub fn release_retired<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        frame_index: u64,
        frames_in_flight: usize,
    ) -> Result<()> {
        let n = frames_in_flight as u64;
        let mut keep = Vec::with_capacity(self.retired.len());
        for retired in std::mem::take(&mut self.retired) {
            if frame_index + 1 >= retired.retired_at + n {
                device.destroy_image(retired.map.image)?;
            } else {
                keep.push(retired);
            }
        }
        self.retired = keep;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<&ShadowMap> {
        self.maps.get(&entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    #[must_use]
    pub fn dummy(&self) -> ImageHandle {
        self.dummy.image
    }

    #[must_use]
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Maps of the current lights in shader index order.
    #[must_use]
    pub fn bindings(&self, lights: &LightSets) -> ShadowBindings {
        let pick = |e: Entity| self.maps.get(&e).map(|m| (e, *m));
        ShadowBindings {
            directional: lights.directional().filter_map(pick).collect(),
            spot: lights.spot().filter_map(pick).collect(),
        }
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for retired in self.retired {
            device.destroy_image(retired.map.image)?;
        }
        for (_, map) in self.maps {
            device.destroy_image(map.image)?;
        }
        device.destroy_image(self.dummy.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn setup() -> (HeadlessDevice, Uploader, ShadowMaps) {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let maps = ShadowMaps::new(
            &mut device,
            &mut uploader,
            64,
            wgpu::TextureFormat::Depth32Float,
            4,
        )
        .unwrap();
        (device, uploader, maps)
    }

    #[test]
    fn directional_map_has_one_layer_per_cascade() {
        let (mut device, mut uploader, mut maps) = setup();
        assert!(maps.ensure(&mut device, &mut uploader, 1, LightKind::Directional, 0).unwrap());
        assert!(!maps.ensure(&mut device, &mut uploader, 1, LightKind::Directional, 0).unwrap());
        let map = maps.get(1).unwrap();
        assert_eq!(map.layers, SHADOW_CASCADE_COUNT as u32);
        assert_eq!(
            device.image_layout(map.image, 3, 0),
            Some(ImageLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn retired_maps_wait_for_every_slot() {
        let (mut device, mut uploader, mut maps) = setup();
        maps.ensure(&mut device, &mut uploader, 1, LightKind::Spot, 0).unwrap();
        let image = maps.get(1).unwrap().image;

        // removed after 5 frames were begun, two frames in flight
        maps.retire(1, 5);
        assert!(maps.get(1).is_none());
        maps.release_retired(&mut device, 5, 2).unwrap();
        assert!(device.image_exists(image));
        maps.release_retired(&mut device, 6, 2).unwrap();
        assert!(!device.image_exists(image));
        assert_eq!(maps.retired_count(), 0);
    }

    #[test]
    fn point_lights_get_no_map() {
        let (mut device, mut uploader, mut maps) = setup();
        assert!(!maps.ensure(&mut device, &mut uploader, 2, LightKind::Point, 0).unwrap());
        assert!(maps.is_empty());
    }
}
