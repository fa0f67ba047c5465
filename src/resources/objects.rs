//! Object Slots
//!
//! Every renderable entity owns one slot in the per-frame object buffer.
//! [`ObjectSlotAllocator`] hands out the smallest free index, growing the
//! high-water mark by one only when no freed index is available. Slots are
//! never compacted.

use std::collections::BTreeSet;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use rustc_hash::FxHashMap;

use super::geometry::MeshId;
use crate::errors::{RenderError, Result};
use crate::scene::Entity;

/// Shader-side object record (80 bytes, addressed as `slot * 80`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuObject {
    pub model: [[f32; 4]; 4],
    pub material_index: u32,
    pub _pad: [u32; 3],
}

impl GpuObject {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    #[must_use]
    pub fn new(model: Mat4, material_index: u32) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            material_index,
            _pad: [0; 3],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSlotAllocator {
    free: BTreeSet<u32>,
    high_water: u32,
    capacity: u32,
}

impl ObjectSlotAllocator {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            free: BTreeSet::new(),
            high_water: 0,
            capacity,
        }
    }

    /// Smallest available slot.
    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(index) = self.free.pop_first() {
            return Ok(index);
        }
        if self.high_water >= self.capacity {
            return Err(RenderError::CapacityExceeded {
                resource: "object slots",
                capacity: self.capacity as usize,
            });
        }
        let index = self.high_water;
        self.high_water += 1;
        Ok(index)
    }

    pub fn release(&mut self, index: u32) {
        debug_assert!(index < self.high_water, "slot {index} was never allocated");
        let fresh = self.free.insert(index);
        debug_assert!(fresh, "slot {index} released twice");
    }

    /// One past the largest slot ever handed out.
    #[must_use]
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.high_water as usize - self.free.len()
    }
}

/// Per-entity render data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderObject {
    pub slot: u32,
    pub mesh: MeshId,
    pub material: u32,
}

/// Renderable entities keyed by entity id.
#[derive(Debug)]
pub struct ObjectTable {
    allocator: ObjectSlotAllocator,
    objects: FxHashMap<Entity, RenderObject>,
}

impl ObjectTable {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            allocator: ObjectSlotAllocator::new(capacity),
            objects: FxHashMap::default(),
        }
    }

    /// Registers or updates an entity. An existing entity keeps its slot.
    pub fn insert(&mut self, entity: Entity, mesh: MeshId, material: u32) -> Result<RenderObject> {
        let slot = match self.objects.get(&entity) {
            Some(existing) => existing.slot,
            None => self.allocator.allocate()?,
        };
        let object = RenderObject {
            slot,
            mesh,
            material,
        };
        self.objects.insert(entity, object);
        Ok(object)
    }

    pub fn remove(&mut self, entity: Entity) -> Option<RenderObject> {
        let object = self.objects.remove(&entity)?;
        self.allocator.release(object.slot);
        Some(object)
    }

    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<&RenderObject> {
        self.objects.get(&entity)
    }

    /// Objects ordered by slot, for deterministic recording.
    #[must_use]
    pub fn sorted(&self) -> Vec<(Entity, RenderObject)> {
        let mut out: Vec<_> = self.objects.iter().map(|(e, o)| (*e, *o)).collect();
        out.sort_unstable_by_key(|(_, o)| o.slot);
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[must_use]
    pub fn allocator(&self) -> &ObjectSlotAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn gpu_object_is_eighty_bytes() {
        assert_eq!(GpuObject::SIZE, 80);
    }

    #[test]
    fn fresh_allocations_grow_by_one() {
        let mut alloc = ObjectSlotAllocator::new(16);
        for expected in 0..5 {
            assert_eq!(alloc.allocate().unwrap(), expected);
        }
        assert_eq!(alloc.high_water(), 5);
    }

    #[test]
    fn smallest_free_index_is_reused_first() {
        let mut alloc = ObjectSlotAllocator::new(16);
        for _ in 0..6 {
            alloc.allocate().unwrap();
        }
        alloc.release(4);
        alloc.release(1);
        alloc.release(3);
        assert_eq!(alloc.allocate().unwrap(), 1);
        assert_eq!(alloc.allocate().unwrap(), 3);
        assert_eq!(alloc.allocate().unwrap(), 4);
        assert_eq!(alloc.allocate().unwrap(), 6);
    }

    #[test]
    fn live_indices_stay_unique_under_churn() {
        let mut alloc = ObjectSlotAllocator::new(1024);
        let mut live: Vec<u32> = (0..50).map(|_| alloc.allocate().unwrap()).collect();
        for round in 0..20u32 {
            // free a deterministic spread, then refill
            let drop_count = (round % 7 + 1) as usize;
            for k in 0..drop_count {
                let pos = (k * 13 + round as usize) % live.len();
                alloc.release(live.swap_remove(pos));
            }
            for _ in 0..drop_count {
                live.push(alloc.allocate().unwrap());
            }
            let unique: FxHashSet<u32> = live.iter().copied().collect();
            assert_eq!(unique.len(), live.len(), "duplicate live slot in round {round}");
            assert_eq!(alloc.live(), live.len());
        }
        assert_eq!(alloc.high_water(), 50);
    }

    #[test]
    fn capacity_bounds_live_objects() {
        let mut alloc = ObjectSlotAllocator::new(2);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        assert!(alloc.allocate().is_err());
        alloc.release(0);
        assert_eq!(alloc.allocate().unwrap(), 0);
    }

    #[test]
    fn table_keeps_slot_on_update() {
        let mut table = ObjectTable::new(8);
        let a = table.insert(7, MeshId(0), 0).unwrap();
        let b = table.insert(7, MeshId(1), 2).unwrap();
        assert_eq!(a.slot, b.slot);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(7).map(|o| o.mesh), Some(MeshId(1)));
        assert!(table.is_empty());
    }
}
