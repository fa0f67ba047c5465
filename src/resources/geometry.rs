//! Geometry Arena
//!
//! All meshes share one vertex buffer and one index buffer. A loaded mesh is
//! an immutable range into them. Loads are deduplicated by source identity
//! and never evicted; the buffers grow by doubling when a load does not fit.

use std::sync::Arc;

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::assets::{Mesh, SourceId, Vertex};
use crate::errors::{RenderError, Result};
use crate::gpu::{BufferDesc, BufferHandle, GpuDevice, Uploader};

const VERTEX_SIZE: u64 = std::mem::size_of::<Vertex>() as u64;
const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

const INITIAL_VERTEX_CAPACITY: u32 = 1 << 16;
const INITIAL_INDEX_CAPACITY: u32 = 3 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// Draw range of a loaded mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRange {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

pub struct GeometryArena {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    vertex_capacity: u32,
    index_capacity: u32,
    vertex_count: u32,
    index_count: u32,
    meshes: Vec<MeshRange>,
    by_source: FxHashMap<SourceId, MeshId>,
    /// Pins source identities for the arena's lifetime.
    sources: Vec<Arc<Mesh>>,
}

fn create_vertex_buffer<D: GpuDevice + ?Sized>(device: &mut D, capacity: u32) -> Result<BufferHandle> {
    device.create_buffer(&BufferDesc {
        label: "Arena Vertex Buffer",
        size: u64::from(capacity) * VERTEX_SIZE,
        usage: wgpu::BufferUsages::VERTEX
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        host_visible: false,
    })
}

fn create_index_buffer<D: GpuDevice + ?Sized>(device: &mut D, capacity: u32) -> Result<BufferHandle> {
    device.create_buffer(&BufferDesc {
        label: "Arena Index Buffer",
        size: u64::from(capacity) * INDEX_SIZE,
        usage: wgpu::BufferUsages::INDEX
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        host_visible: false,
    })
}

impl GeometryArena {
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D) -> Result<Self> {
        Self::with_capacity(device, INITIAL_VERTEX_CAPACITY, INITIAL_INDEX_CAPACITY)
    }

    pub fn with_capacity<D: GpuDevice + ?Sized>(
        device: &mut D,
        vertex_capacity: u32,
        index_capacity: u32,
    ) -> Result<Self> {
        let vertex_capacity = vertex_capacity.max(3);
        let index_capacity = index_capacity.max(3);
        Ok(Self {
            vertex_buffer: create_vertex_buffer(device, vertex_capacity)?,
            index_buffer: create_index_buffer(device, index_capacity)?,
            vertex_capacity,
            index_capacity,
            vertex_count: 0,
            index_count: 0,
            meshes: Vec::new(),
            by_source: FxHashMap::default(),
            sources: Vec::new(),
        })
    }

    /// Returns the cached id for a known source, otherwise uploads it.
    pub fn load<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        mesh: &Arc<Mesh>,
    ) -> Result<MeshId> {
        let source = SourceId::of(mesh);
        if let Some(&id) = self.by_source.get(&source) {
            return Ok(id);
        }
        if mesh.is_empty() {
            return Err(RenderError::InvalidAsset("mesh has no vertices or indices".into()));
        }
        if let Some(&bad) = mesh
            .indices
            .iter()
            .find(|&&i| i as usize >= mesh.vertices.len())
        {
            return Err(RenderError::InvalidAsset(format!(
                "index {bad} out of range for {} vertices",
                mesh.vertices.len()
            )));
        }

        let vertices = mesh.vertices.len() as u32;
        let indices = mesh.indices.len() as u32;
        self.reserve(device, uploader, vertices, indices)?;

        uploader.upload_buffer(
            device,
            self.vertex_buffer,
            u64::from(self.vertex_count) * VERTEX_SIZE,
            bytemuck::cast_slice(&mesh.vertices),
        )?;
        uploader.upload_buffer(
            device,
            self.index_buffer,
            u64::from(self.index_count) * INDEX_SIZE,
            bytemuck::cast_slice(&mesh.indices),
        )?;

        let id = MeshId(self.meshes.len() as u32);
        self.meshes.push(MeshRange {
            index_count: indices,
            first_index: self.index_count,
            vertex_offset: self.vertex_count as i32,
        });
        self.vertex_count += vertices;
        self.index_count += indices;
        self.by_source.insert(source, id);
        self.sources.push(mesh.clone());
        debug!("Loaded mesh {id:?}: {vertices} vertices, {indices} indices");
        Ok(id)
    }

    fn reserve<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        vertices: u32,
        indices: u32,
    ) -> Result<()> {
        let need_vertices = self.vertex_count + vertices;
        if need_vertices > self.vertex_capacity {
            let new_cap = (self.vertex_capacity * 2).max(need_vertices);
            info!(
                "Geometry arena expanding vertex capacity: {} -> {}",
                self.vertex_capacity, new_cap
            );
            let buffer = create_vertex_buffer(device, new_cap)?;
            uploader.copy_buffer(
                device,
                self.vertex_buffer,
                buffer,
                u64::from(self.vertex_count) * VERTEX_SIZE,
            )?;
            device.destroy_buffer(self.vertex_buffer)?;
            self.vertex_buffer = buffer;
            self.vertex_capacity = new_cap;
        }

        let need_indices = self.index_count + indices;
        if need_indices > self.index_capacity {
            let new_cap = (self.index_capacity * 2).max(need_indices);
            info!(
                "Geometry arena expanding index capacity: {} -> {}",
                self.index_capacity, new_cap
            );
            let buffer = create_index_buffer(device, new_cap)?;
            uploader.copy_buffer(
                device,
                self.index_buffer,
                buffer,
                u64::from(self.index_count) * INDEX_SIZE,
            )?;
            device.destroy_buffer(self.index_buffer)?;
            self.index_buffer = buffer;
            self.index_capacity = new_cap;
        }
        Ok(())
    }

    #[must_use]
    pub fn range(&self, id: MeshId) -> Option<MeshRange> {
        self.meshes.get(id.0 as usize).copied()
    }

    #[must_use]
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// High-water marks `(vertices, indices)`.
    #[must_use]
    pub fn used(&self) -> (u32, u32) {
        (self.vertex_count, self.index_count)
    }

    #[must_use]
    pub fn capacity(&self) -> (u32, u32) {
        (self.vertex_capacity, self.index_capacity)
    }

    #[must_use]
    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    #[must_use]
    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.destroy_buffer(self.vertex_buffer)?;
        device.destroy_buffer(self.index_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Vertex;
    use crate::gpu::HeadlessDevice;

    fn quad() -> Arc<Mesh> {
        let v = |x: f32, y: f32| Vertex::new([x, y, 0.0], [0.0, 0.0, 1.0], [x, y]);
        Arc::new(Mesh::new(
            vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)],
            vec![0, 1, 2, 0, 2, 3],
        ))
    }

    #[test]
    fn ranges_are_appended() {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut arena = GeometryArena::new(&mut device).unwrap();

        let a = arena.load(&mut device, &mut uploader, &quad()).unwrap();
        let b = arena.load(&mut device, &mut uploader, &quad()).unwrap();
        assert_ne!(a, b);
        let rb = arena.range(b).unwrap();
        assert_eq!(rb.first_index, 6);
        assert_eq!(rb.vertex_offset, 4);
        assert_eq!(arena.used(), (8, 12));
    }

    #[test]
    fn growth_preserves_existing_data() {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut arena = GeometryArena::with_capacity(&mut device, 4, 6).unwrap();

        let first = quad();
        arena.load(&mut device, &mut uploader, &first).unwrap();
        let old_buffer = arena.vertex_buffer();
        arena.load(&mut device, &mut uploader, &quad()).unwrap();

        assert_ne!(arena.vertex_buffer(), old_buffer);
        assert!(!device.buffer_exists(old_buffer));
        assert_eq!(arena.capacity(), (8, 12));
        let bytes = device.buffer_bytes(arena.vertex_buffer()).unwrap();
        let stored: Vec<Vertex> = bytemuck::pod_collect_to_vec(&bytes[..4 * VERTEX_SIZE as usize]);
        assert_eq!(stored, first.vertices);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut device = HeadlessDevice::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut arena = GeometryArena::new(&mut device).unwrap();
        let mesh = Arc::new(Mesh::new(Mesh::default_triangle().vertices, vec![0, 1, 7]));
        assert!(arena.load(&mut device, &mut uploader, &mesh).is_err());
        assert_eq!(arena.mesh_count(), 0);
    }
}
