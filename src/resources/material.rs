//! Material Registry
//!
//! Materials are resolved to a [`GpuMaterial`] of bindless texture indices
//! plus two scalars and deduplicated by bitwise equality of all eight
//! fields. The registry array is copied into every frame slot's material
//! buffer.

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;

use super::texture::DefaultTexture;
use crate::errors::{RenderError, Result};

/// Shader-side material record (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    pub diffuse: u32,
    pub normal: u32,
    pub metalness: u32,
    pub roughness: u32,
    pub occlusion: u32,
    pub emissive: u32,
    pub emissive_factor: f32,
    pub alpha_cutoff: f32,
}

impl Default for GpuMaterial {
    fn default() -> Self {
        Self {
            diffuse: DefaultTexture::Diffuse.index(),
            normal: DefaultTexture::Normal.index(),
            metalness: DefaultTexture::Metalness.index(),
            roughness: DefaultTexture::Roughness.index(),
            occlusion: DefaultTexture::Occlusion.index(),
            emissive: DefaultTexture::Emissive.index(),
            emissive_factor: 0.0,
            alpha_cutoff: 0.5,
        }
    }
}

impl GpuMaterial {
    /// Bit pattern used as the deduplication key.
    fn key(&self) -> [u32; 8] {
        bytemuck::cast(*self)
    }
}

pub struct MaterialRegistry {
    materials: Vec<GpuMaterial>,
    lookup: FxHashMap<[u32; 8], u32>,
    capacity: u32,
}

impl MaterialRegistry {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            materials: Vec::new(),
            lookup: FxHashMap::default(),
            capacity,
        }
    }

    /// Returns the index of an equal material, inserting it if new.
    pub fn add(&mut self, material: GpuMaterial) -> Result<u32> {
        let key = material.key();
        if let Some(&index) = self.lookup.get(&key) {
            return Ok(index);
        }
        if self.materials.len() as u32 >= self.capacity {
            return Err(RenderError::CapacityExceeded {
                resource: "materials",
                capacity: self.capacity as usize,
            });
        }
        let index = self.materials.len() as u32;
        self.materials.push(material);
        self.lookup.insert(key, index);
        Ok(index)
    }

    /// Index as seen by shaders; unknown indices fall back to material 0.
    #[must_use]
    pub fn shader_index(&self, index: u32) -> u32 {
        if (index as usize) < self.materials.len() {
            index
        } else {
            0
        }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&GpuMaterial> {
        self.materials.get(index as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.materials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_materials_share_an_entry() {
        let mut registry = MaterialRegistry::new(8);
        let a = registry.add(GpuMaterial::default()).unwrap();
        let b = registry.add(GpuMaterial::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn any_field_difference_is_a_new_entry() {
        let mut registry = MaterialRegistry::new(8);
        registry.add(GpuMaterial::default()).unwrap();
        let other = GpuMaterial {
            alpha_cutoff: 0.25,
            ..Default::default()
        };
        assert_eq!(registry.add(other).unwrap(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_index_falls_back_to_zero() {
        let mut registry = MaterialRegistry::new(8);
        registry.add(GpuMaterial::default()).unwrap();
        assert_eq!(registry.shader_index(0), 0);
        assert_eq!(registry.shader_index(42), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = MaterialRegistry::new(1);
        registry.add(GpuMaterial::default()).unwrap();
        let other = GpuMaterial {
            diffuse: 9,
            ..Default::default()
        };
        assert!(registry.add(other).is_err());
    }
}
