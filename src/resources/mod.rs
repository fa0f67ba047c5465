//! Shared GPU Resources
//!
//! Cross-frame state written only through fence-gated uploads:
//!
//! - [`GeometryArena`]: one vertex/index buffer pair holding every mesh
//! - [`TextureRegistry`]: images, cached samplers, and the bindless array
//! - [`MaterialRegistry`]: deduplicated material records
//! - [`ObjectTable`]: entity → object slot, backed by [`ObjectSlotAllocator`]
//! - [`LightSets`]: directional, point, and spot membership

pub mod geometry;
pub mod lights;
pub mod material;
pub mod objects;
pub mod texture;

pub use geometry::{GeometryArena, MeshId, MeshRange};
pub use lights::{GpuLight, LightSets};
pub use material::{GpuMaterial, MaterialRegistry};
pub use objects::{GpuObject, ObjectSlotAllocator, ObjectTable, RenderObject};
pub use texture::{
    DEFAULT_SAMPLER_KEY, DEFAULT_TEXTURE_COUNT, DefaultTexture, ImageId, LoadedImage,
    TextureInsert, TextureRegistry,
};
