//! Light Sets
//!
//! Lights are tracked as three independent sets of entity ids, one per kind.
//! Iteration order is the entity order, which fixes both the light buffer
//! layout and the shadow-map indices for a frame.

use std::collections::BTreeSet;

use bytemuck::{Pod, Zeroable};
use log::warn;

use crate::scene::{Entity, LightKind, World};

/// Shader-side light record: four vec4s.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct GpuLight {
    pub position: [f32; 4],
    /// xyz: forward direction.
    pub direction: [f32; 4],
    /// rgb: color, a: intensity.
    pub color: [f32; 4],
    /// x: cos(inner), y: cos(outer), z: outer angle in radians,
    /// w: shadow-map array index or -1.
    pub cutoff: [f32; 4],
}

/// `uvec4(directional, point, spot, directionalShadows)` header preceding the
/// records.
pub const LIGHT_HEADER_SIZE: u64 = 16;
pub const GPU_LIGHT_SIZE: u64 = std::mem::size_of::<GpuLight>() as u64;

#[derive(Debug, Default, Clone)]
pub struct LightSets {
    directional: BTreeSet<Entity>,
    point: BTreeSet<Entity>,
    spot: BTreeSet<Entity>,
}

impl LightSets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_mut(&mut self, kind: LightKind) -> &mut BTreeSet<Entity> {
        match kind {
            LightKind::Directional => &mut self.directional,
            LightKind::Point => &mut self.point,
            LightKind::Spot => &mut self.spot,
        }
    }

    /// Adds the entity to the set of `kind`, leaving any other set.
    /// Returns `true` if it was not already a light of that kind.
    pub fn insert(&mut self, entity: Entity, kind: LightKind) -> bool {
        let previous = self.kind_of(entity);
        if previous == Some(kind) {
            return false;
        }
        self.remove(entity);
        self.set_mut(kind).insert(entity)
    }

    pub fn remove(&mut self, entity: Entity) -> Option<LightKind> {
        let kind = self.kind_of(entity)?;
        self.set_mut(kind).remove(&entity);
        Some(kind)
    }

    #[must_use]
    pub fn kind_of(&self, entity: Entity) -> Option<LightKind> {
        if self.directional.contains(&entity) {
            Some(LightKind::Directional)
        } else if self.point.contains(&entity) {
            Some(LightKind::Point)
        } else if self.spot.contains(&entity) {
            Some(LightKind::Spot)
        } else {
            None
        }
    }

    pub fn directional(&self) -> impl Iterator<Item = Entity> + '_ {
        self.directional.iter().copied()
    }

    pub fn point(&self) -> impl Iterator<Item = Entity> + '_ {
        self.point.iter().copied()
    }

    pub fn spot(&self) -> impl Iterator<Item = Entity> + '_ {
        self.spot.iter().copied()
    }

    #[must_use]
    pub fn counts(&self) -> [u32; 3] {
        [
            self.directional.len() as u32,
            self.point.len() as u32,
            self.spot.len() as u32,
        ]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.directional.len() + self.point.len() + self.spot.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header plus directional, point, then spot records, truncated to
    /// `capacity` lights. `shadow_index` maps a light to its shadow-map slot;
    /// the header's last word is the number of directional shadow maps, where
    /// spot maps start in both the map array and the cascade buffer.
    #[must_use]
    pub fn build_buffer(
        &self,
        world: &dyn World,
        capacity: u32,
        directional_shadows: u32,
        shadow_index: impl Fn(Entity) -> Option<u32>,
    ) -> Vec<u8> {
        let mut records = Vec::with_capacity(self.len());
        let mut counts = [0u32; 3];
        let kinds = [
            (0, &self.directional),
            (1, &self.point),
            (2, &self.spot),
        ];
        for (slot, set) in kinds {
            for &entity in set {
                if records.len() as u32 >= capacity {
                    warn!("Light buffer full ({capacity}); dropping light {entity}");
                    break;
                }
                let Some(light) = world.light(entity) else {
                    warn!("Light entity {entity} has no Light component");
                    continue;
                };
                let transform = world.transform(entity).unwrap_or_default();
                let dir = transform.forward();
                records.push(GpuLight {
                    position: transform.position.extend(1.0).to_array(),
                    direction: dir.extend(0.0).to_array(),
                    color: light.color.extend(light.intensity).to_array(),
                    cutoff: [
                        light.inner_cutoff.cos(),
                        light.outer_cutoff.cos(),
                        light.outer_cutoff,
                        shadow_index(entity).map_or(-1.0, |i| i as f32),
                    ],
                });
                counts[slot] += 1;
            }
        }

        let header = [counts[0], counts[1], counts[2], directional_shadows];
        let mut bytes = Vec::with_capacity(LIGHT_HEADER_SIZE as usize + records.len() * GPU_LIGHT_SIZE as usize);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&records));
        bytes
    }
}
