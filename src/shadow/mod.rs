//! Cascaded shadows.
//!
//! - [`cascade`]: per-frame light matrices fitted to the camera frustum
//! - [`maps`]: layered depth images owned by shadow-casting lights
//! - [`pass`]: depth-only rendering into those images

pub mod cascade;
pub mod maps;
pub mod pass;

pub use cascade::{
    CameraFrustum, CascadeBounds, ShadowCascade, ShadowMatrix, ShadowSet, SpotShadowInput,
    cascade_bounds, cascade_split_fractions, compute_shadows, directional_cascade_vp,
    frustum_corners_world, spot_light_vp,
};
pub use maps::{ShadowBindings, ShadowMap, ShadowMaps};
pub use pass::{
    CASCADE_RECORD_SIZE, GpuCascade, SHADOW_MATRIX_SIZE, ShadowPass, first_matrix_index,
    shadow_buffer_bytes,
};
