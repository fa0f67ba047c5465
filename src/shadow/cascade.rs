//! Shadow Cascade Computation
//!
//! Pure math turning the camera frustum and the shadow-casting lights into
//! light view-projection matrices. Recomputed every frame, never cached.
//!
//! # Provided Functions
//!
//! - Cascade split fractions (blended logarithmic/uniform scheme)
//! - World-space frustum corners from an inverse view-projection
//! - Bounding sphere of a cascade slice, snapped to 1/16 unit
//! - Orthographic VP for a directional cascade
//! - Perspective VP for a spot light
//! - [`compute_shadows`]: the whole per-frame computation

use glam::{Mat4, Vec3, Vec4};

use crate::settings::SHADOW_CASCADE_COUNT;

/// Weight of the logarithmic distribution in the split blend.
pub const CASCADE_SPLIT_LAMBDA: f32 = 0.95;

/// Radii are rounded up to this step to reduce shimmer.
pub const RADIUS_SNAP: f32 = 16.0;

pub const SPOT_SHADOW_NEAR: f32 = 0.05;
pub const SPOT_SHADOW_FAR: f32 = 50.0;

// ============================================================================
// Inputs / Outputs
// ============================================================================

/// Camera state the cascades are fitted to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFrustum {
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotShadowInput {
    pub position: Vec3,
    pub direction: Vec3,
    /// Outer cone angle in radians, measured from the axis.
    pub outer_cutoff: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowCascade {
    pub view_proj: Mat4,
    /// Negated view-space far distance of the cascade.
    pub split_depth: f32,
}

/// One entry of the flat shadow-matrix array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowMatrix {
    pub view_proj: Mat4,
    /// `None` for spot lights.
    pub split_depth: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeBounds {
    pub center: Vec3,
    pub radius: f32,
    pub corners: [Vec3; 8],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowSet {
    pub directional: Vec<[ShadowCascade; SHADOW_CASCADE_COUNT]>,
    pub spot: Vec<Mat4>,
}

impl ShadowSet {
    /// Directional cascades (light-major, cascade-minor), then spot lights.
    #[must_use]
    pub fn flatten(&self) -> Vec<ShadowMatrix> {
        let cascades = self.directional.iter().flatten().map(|c| ShadowMatrix {
            view_proj: c.view_proj,
            split_depth: Some(c.split_depth),
        });
        let spots = self.spot.iter().map(|m| ShadowMatrix {
            view_proj: *m,
            split_depth: None,
        });
        cascades.chain(spots).collect()
    }

    #[must_use]
    pub fn matrix_count(&self) -> usize {
        self.directional.len() * SHADOW_CASCADE_COUNT + self.spot.len()
    }
}

// ============================================================================
// Cascade Split Computation
// ============================================================================

/// Normalized far boundary of each cascade in `(0, 1]`.
///
/// `d_i = λ·(log_i − uniform_i) + uniform_i` with
/// `log_i = near·(far/near)^((i+1)/K)` and `uniform_i = near + (far−near)·(i+1)/K`,
/// mapped to `(d_i − near)/(far − near)`. The last split is exactly 1.
#[must_use]
pub fn cascade_split_fractions(near: f32, far: f32, count: usize) -> Vec<f32> {
    let range = far - near;
    let ratio = far / near;
    let mut splits: Vec<f32> = (0..count)
        .map(|i| {
            let p = (i + 1) as f32 / count as f32;
            let log = near * ratio.powf(p);
            let uniform = near + range * p;
            let d = CASCADE_SPLIT_LAMBDA * (log - uniform) + uniform;
            (d - near) / range
        })
        .collect();
    if let Some(last) = splits.last_mut() {
        *last = 1.0;
    }
    splits
}

// ============================================================================
// Frustum Corners
// ============================================================================

/// Unit-cube corners (depth 0..1) transformed by `inverse(projection * view)`.
/// Near face first, then far face, in matching order.
#[must_use]
pub fn frustum_corners_world(view: Mat4, projection: Mat4) -> [Vec3; 8] {
    let inv = (projection * view).inverse();
    let ndc = [
        Vec3::new(-1.0, 1.0, 0.0),
        Vec3::new(1.0, 1.0, 0.0),
        Vec3::new(1.0, -1.0, 0.0),
        Vec3::new(-1.0, -1.0, 0.0),
        Vec3::new(-1.0, 1.0, 1.0),
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::new(1.0, -1.0, 1.0),
        Vec3::new(-1.0, -1.0, 1.0),
    ];
    ndc.map(|c| {
        let p: Vec4 = inv * c.extend(1.0);
        p.truncate() / p.w
    })
}

/// Sub-frustum between two split fractions and its bounding sphere.
#[must_use]
pub fn cascade_bounds(frustum: &[Vec3; 8], from_split: f32, to_split: f32) -> CascadeBounds {
    let mut corners = [Vec3::ZERO; 8];
    for i in 0..4 {
        let ray = frustum[i + 4] - frustum[i];
        corners[i] = frustum[i] + ray * from_split;
        corners[i + 4] = frustum[i] + ray * to_split;
    }

    let center = corners.iter().copied().sum::<Vec3>() / 8.0;
    let radius = corners
        .iter()
        .map(|c| c.distance(center))
        .fold(0.0f32, f32::max);
    let radius = (radius * RADIUS_SNAP).ceil() / RADIUS_SNAP;

    CascadeBounds {
        center,
        radius,
        corners,
    }
}

// ============================================================================
// Light Matrices
// ============================================================================

fn up_for(direction: Vec3) -> Vec3 {
    if direction.y.abs() > 0.99 {
        Vec3::X
    } else {
        Vec3::Y
    }
}

/// Orthographic VP enclosing a cascade's bounding sphere, looking along
/// `light_direction`.
#[must_use]
pub fn directional_cascade_vp(light_direction: Vec3, bounds: &CascadeBounds) -> Mat4 {
    let dir = light_direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let r = bounds.radius;
    let eye = bounds.center - dir * r;
    let view = Mat4::look_at_rh(eye, bounds.center, up_for(dir));
    let projection = Mat4::orthographic_rh(-r, r, -r, r, 0.0, 2.0 * r);
    projection * view
}

/// Perspective VP covering a spot light cone.
#[must_use]
pub fn spot_light_vp(spot: &SpotShadowInput, clip_y_down: bool) -> Mat4 {
    let dir = spot.direction.try_normalize().unwrap_or(Vec3::NEG_Z);
    let view = Mat4::look_at_rh(spot.position, spot.position + dir, up_for(dir));
    let fov = (spot.outer_cutoff * 2.0).clamp(1e-3, std::f32::consts::PI - 1e-3);
    let mut projection = Mat4::perspective_rh(fov, 1.0, SPOT_SHADOW_NEAR, SPOT_SHADOW_FAR);
    if clip_y_down {
        projection.y_axis.y *= -1.0;
    }
    projection * view
}

/// Cascades for every directional light and a matrix for every spot light.
#[must_use]
pub fn compute_shadows(
    camera: &CameraFrustum,
    directional: &[Vec3],
    spots: &[SpotShadowInput],
    clip_y_down: bool,
) -> ShadowSet {
    let splits = cascade_split_fractions(camera.near, camera.far, SHADOW_CASCADE_COUNT);
    let frustum = frustum_corners_world(camera.view, camera.projection);
    let clip_range = camera.far - camera.near;

    let mut previous = 0.0;
    let bounds: Vec<(CascadeBounds, f32)> = splits
        .iter()
        .map(|&split| {
            let b = cascade_bounds(&frustum, previous, split);
            previous = split;
            (b, -(camera.near + split * clip_range))
        })
        .collect();

    let directional = directional
        .iter()
        .map(|&dir| {
            std::array::from_fn(|i| {
                let (b, split_depth) = &bounds[i];
                ShadowCascade {
                    view_proj: directional_cascade_vp(dir, b),
                    split_depth: *split_depth,
                }
            })
        })
        .collect();

    let spot = spots.iter().map(|s| spot_light_vp(s, clip_y_down)).collect();

    ShadowSet { directional, spot }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cascade_covers_everything() {
        assert_eq!(cascade_split_fractions(0.1, 100.0, 1), vec![1.0]);
    }

    #[test]
    fn flatten_puts_spots_last() {
        let cascade = ShadowCascade {
            view_proj: Mat4::IDENTITY,
            split_depth: -1.0,
        };
        let set = ShadowSet {
            directional: vec![[cascade; SHADOW_CASCADE_COUNT]],
            spot: vec![Mat4::ZERO],
        };
        let flat = set.flatten();
        assert_eq!(flat.len(), SHADOW_CASCADE_COUNT + 1);
        assert_eq!(flat.last().unwrap().split_depth, None);
        assert_eq!(flat[0].split_depth, Some(-1.0));
    }
}
