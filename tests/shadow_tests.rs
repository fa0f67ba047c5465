//! Shadow Tests
//!
//! Tests for:
//! - Cascade split fractions (blended logarithmic/uniform scheme)
//! - Cascade bounding spheres and radius snapping
//! - Directional cascade and spot light VP construction
//! - Per-frame shadow set layout and matrix indexing
//! - Shadow map lifecycle through the renderer (create, cap, retire, release)

use std::sync::Arc;

use glam::{Mat4, Vec3};

use ember::shadow::{
    CameraFrustum, ShadowBindings, SpotShadowInput, cascade_bounds, cascade_split_fractions,
    compute_shadows, directional_cascade_vp, first_matrix_index, frustum_corners_world,
    shadow_buffer_bytes, spot_light_vp,
};
use ember::shadow::{CASCADE_RECORD_SIZE, SHADOW_MATRIX_SIZE};
use ember::{
    ComponentKind, HeadlessDevice, Light, LightKind, Renderer, RendererSettings,
    SHADOW_CASCADE_COUNT, SceneStore, Transform,
};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn test_frustum() -> CameraFrustum {
    CameraFrustum {
        view: Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y),
        projection: Mat4::perspective_rh(45f32.to_radians(), 16.0 / 9.0, 0.1, 100.0),
        near: 0.1,
        far: 100.0,
    }
}

// ============================================================================
// cascade_split_fractions Tests
// ============================================================================

#[test]
fn splits_end_at_one() {
    let splits = cascade_split_fractions(0.1, 100.0, SHADOW_CASCADE_COUNT);
    assert_eq!(splits.len(), SHADOW_CASCADE_COUNT);
    assert_eq!(splits[SHADOW_CASCADE_COUNT - 1], 1.0, "last split must be exactly 1");
}

#[test]
fn splits_strictly_increase_within_unit_range() {
    let splits = cascade_split_fractions(0.1, 100.0, SHADOW_CASCADE_COUNT);
    let mut previous = 0.0;
    for (i, &split) in splits.iter().enumerate() {
        assert!(
            split > previous && split <= 1.0,
            "split {i} = {split} should lie in ({previous}, 1]"
        );
        previous = split;
    }
}

#[test]
fn splits_favor_near_cascades() {
    // The logarithmic weight pulls the first boundary well short of uniform.
    let splits = cascade_split_fractions(0.1, 100.0, 4);
    assert!(
        splits[0] < 0.25,
        "first split should be closer than the uniform quarter, got {}",
        splits[0]
    );
}

#[test]
fn splits_match_blend_formula() {
    let (near, far) = (0.5f32, 50.0f32);
    let splits = cascade_split_fractions(near, far, 4);
    let p = 0.5f32;
    let log = near * (far / near).powf(p);
    let uniform = near + (far - near) * p;
    let d = 0.95 * (log - uniform) + uniform;
    assert!(approx(splits[1], (d - near) / (far - near)));
}

// ============================================================================
// Frustum and Bounds Tests
// ============================================================================

#[test]
fn frustum_corners_lie_on_near_and_far_planes() {
    let view = Mat4::IDENTITY;
    let projection = Mat4::perspective_rh(60f32.to_radians(), 1.0, 1.0, 10.0);
    let corners = frustum_corners_world(view, projection);
    for corner in &corners[..4] {
        assert!(approx(corner.z, -1.0), "near corner z = {}", corner.z);
    }
    for corner in &corners[4..] {
        assert!((corner.z + 10.0).abs() < 1e-3, "far corner z = {}", corner.z);
    }
}

#[test]
fn cascade_sphere_encloses_its_slice() {
    let frustum = test_frustum();
    let corners = frustum_corners_world(frustum.view, frustum.projection);
    let bounds = cascade_bounds(&corners, 0.1, 0.4);
    for corner in bounds.corners {
        assert!(
            corner.distance(bounds.center) <= bounds.radius + EPSILON,
            "corner {corner} lies outside radius {}",
            bounds.radius
        );
    }
}

#[test]
fn cascade_radius_is_snapped() {
    let frustum = test_frustum();
    let corners = frustum_corners_world(frustum.view, frustum.projection);
    let bounds = cascade_bounds(&corners, 0.0, 0.2);
    let steps = bounds.radius * 16.0;
    assert!(approx(steps, steps.round()), "radius {} is not a 1/16 multiple", bounds.radius);
}

// ============================================================================
// Light Matrix Tests
// ============================================================================

#[test]
fn directional_vp_centers_cascade() {
    let frustum = test_frustum();
    let corners = frustum_corners_world(frustum.view, frustum.projection);
    let bounds = cascade_bounds(&corners, 0.0, 0.3);
    let vp = directional_cascade_vp(Vec3::new(-0.3, -1.0, -0.2), &bounds);

    let ndc = vp.project_point3(bounds.center);
    assert!(approx(ndc.x, 0.0) && approx(ndc.y, 0.0), "center maps to {ndc}");
    assert!(approx(ndc.z, 0.5), "center depth should be mid-range, got {}", ndc.z);

    for corner in bounds.corners {
        let p = vp.project_point3(corner);
        assert!(
            p.x.abs() <= 1.0 + EPSILON && p.y.abs() <= 1.0 + EPSILON,
            "corner {corner} projects outside the map: {p}"
        );
        assert!((-EPSILON..=1.0 + EPSILON).contains(&p.z));
    }
}

#[test]
fn directional_vp_handles_vertical_light() {
    let frustum = test_frustum();
    let corners = frustum_corners_world(frustum.view, frustum.projection);
    let bounds = cascade_bounds(&corners, 0.0, 1.0);
    let vp = directional_cascade_vp(Vec3::NEG_Y, &bounds);
    assert!(vp.is_finite(), "straight-down light must not degenerate");
}

#[test]
fn spot_vp_looks_down_the_axis() {
    let spot = SpotShadowInput {
        position: Vec3::new(0.0, 5.0, 0.0),
        direction: Vec3::NEG_Z,
        outer_cutoff: 0.5,
    };
    let vp = spot_light_vp(&spot, false);
    let ndc = vp.project_point3(Vec3::new(0.0, 5.0, -10.0));
    assert!(approx(ndc.x, 0.0) && approx(ndc.y, 0.0), "axis point maps to {ndc}");
    assert!(ndc.z > 0.0 && ndc.z < 1.0);
}

#[test]
fn spot_vp_flips_y_for_y_down_clip_space() {
    let spot = SpotShadowInput {
        position: Vec3::ZERO,
        direction: Vec3::NEG_Z,
        outer_cutoff: 0.6,
    };
    let above = Vec3::new(0.0, 1.0, -5.0);
    let up = spot_light_vp(&spot, false).project_point3(above);
    let down = spot_light_vp(&spot, true).project_point3(above);
    assert!(up.y > 0.0);
    assert!(approx(up.y, -down.y));
}

// ============================================================================
// Shadow Set Tests
// ============================================================================

#[test]
fn shadow_set_counts_cascades_and_spots() {
    let spot = SpotShadowInput {
        position: Vec3::ONE,
        direction: Vec3::NEG_Y,
        outer_cutoff: 0.4,
    };
    let set = compute_shadows(
        &test_frustum(),
        &[Vec3::NEG_Y, Vec3::new(1.0, -1.0, 0.0)],
        &[spot],
        true,
    );
    assert_eq!(set.directional.len(), 2);
    assert_eq!(set.spot.len(), 1);
    assert_eq!(set.matrix_count(), 2 * SHADOW_CASCADE_COUNT + 1);
}

#[test]
fn split_depths_are_negated_view_distances() {
    let frustum = test_frustum();
    let set = compute_shadows(&frustum, &[Vec3::NEG_Y], &[], true);
    let cascades = &set.directional[0];
    assert!(approx(cascades[SHADOW_CASCADE_COUNT - 1].split_depth, -frustum.far));
    for pair in cascades.windows(2) {
        assert!(
            pair[1].split_depth < pair[0].split_depth,
            "split depths should grow more negative"
        );
    }
}

#[test]
fn buffer_bytes_follow_flat_layout() {
    let spot = SpotShadowInput {
        position: Vec3::ZERO,
        direction: Vec3::NEG_Z,
        outer_cutoff: 0.3,
    };
    let set = compute_shadows(&test_frustum(), &[Vec3::NEG_Y], &[spot], true);
    let (matrices, cascades) = shadow_buffer_bytes(&set);
    let count = (SHADOW_CASCADE_COUNT + 1) as u64;
    assert_eq!(matrices.len() as u64, count * SHADOW_MATRIX_SIZE);
    assert_eq!(cascades.len() as u64, count * CASCADE_RECORD_SIZE);
}

#[test]
fn spot_matrices_follow_every_cascade() {
    let bindings = ShadowBindings::default();
    assert_eq!(first_matrix_index(&bindings, false, 2), 2 * SHADOW_CASCADE_COUNT as u32);
    assert_eq!(first_matrix_index(&bindings, true, 1), 1);
}

// ============================================================================
// Shadow Map Lifecycle Tests
// ============================================================================

fn small_settings() -> RendererSettings {
    RendererSettings {
        headless_extent: (160, 90),
        shadow_map_resolution: 64,
        max_shadow_maps: 2,
        max_particles: 64,
        ..Default::default()
    }
}

fn add_light(
    renderer: &mut Renderer<HeadlessDevice>,
    scene: &SceneStore,
    light: Light,
) -> ember::Entity {
    let entity = scene.spawn();
    scene.set_transform(
        entity,
        Transform::looking_along(Vec3::new(0.0, 10.0, 0.0), Vec3::new(0.2, -1.0, 0.1)),
    );
    scene.set_light(entity, light);
    renderer
        .on_component_added(entity, ComponentKind::Light)
        .expect("light registration failed");
    entity
}

#[test]
fn shadow_casting_lights_get_layered_maps() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scene = Arc::new(SceneStore::new());
    let mut renderer =
        Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), None).unwrap();

    let sun = add_light(&mut renderer, &scene, Light::directional(Vec3::ONE, 3.0));
    let spot = add_light(&mut renderer, &scene, Light::spot(Vec3::ONE, 10.0, 0.3, 0.5));
    let bulb = add_light(&mut renderer, &scene, Light::point(Vec3::ONE, 5.0));

    let maps = renderer.shadow_maps();
    assert_eq!(maps.get(sun).map(|m| m.layers), Some(SHADOW_CASCADE_COUNT as u32));
    assert_eq!(maps.get(spot).map(|m| (m.layers, m.kind)), Some((1, LightKind::Spot)));
    assert!(maps.get(bulb).is_none(), "point lights cast no shadow");

    let image = maps.get(sun).unwrap().image;
    let (width, height, layers, _) = renderer.device().image_shape(image).unwrap();
    assert_eq!((width, height, layers), (64, 64, SHADOW_CASCADE_COUNT as u32));

    renderer.update(0.016).unwrap();
}

#[test]
fn lights_over_capacity_cast_no_shadow() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer =
        Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), None).unwrap();

    let first = add_light(&mut renderer, &scene, Light::directional(Vec3::ONE, 1.0));
    let second = add_light(&mut renderer, &scene, Light::spot(Vec3::ONE, 1.0, 0.2, 0.4));
    let third = add_light(&mut renderer, &scene, Light::directional(Vec3::ONE, 1.0));

    assert!(renderer.shadow_maps().get(first).is_some());
    assert!(renderer.shadow_maps().get(second).is_some());
    assert!(renderer.shadow_maps().get(third).is_none());
    assert_eq!(renderer.lights().len(), 3, "the light itself still shades");

    renderer.update(0.016).unwrap();
}

#[test]
fn removed_light_map_outlives_the_frame_in_flight() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer =
        Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), None).unwrap();
    let sun = add_light(&mut renderer, &scene, Light::directional(Vec3::ONE, 2.0));
    renderer.update(0.016).unwrap();

    let image = renderer.shadow_maps().get(sun).unwrap().image;
    scene.remove(sun, ComponentKind::Light);
    renderer
        .on_component_removed(sun, ComponentKind::Light)
        .unwrap();

    assert!(renderer.shadow_maps().get(sun).is_none());
    assert_eq!(renderer.shadow_maps().retired_count(), 1);
    assert!(
        renderer.device().image_exists(image),
        "retired map must survive until its slot is waited on"
    );

    // One frame in flight: the next frame waits on the only slot.
    renderer.update(0.016).unwrap();
    assert_eq!(renderer.shadow_maps().retired_count(), 0);
    assert!(!renderer.device().image_exists(image));
}

#[test]
fn changing_light_kind_replaces_its_map() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer =
        Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), None).unwrap();
    let light = add_light(&mut renderer, &scene, Light::directional(Vec3::ONE, 1.0));
    let before = renderer.shadow_maps().get(light).unwrap().image;

    scene.set_light(light, Light::spot(Vec3::ONE, 1.0, 0.2, 0.4));
    renderer
        .on_component_added(light, ComponentKind::Light)
        .unwrap();

    let after = renderer.shadow_maps().get(light).unwrap();
    assert_ne!(after.image, before);
    assert_eq!(after.kind, LightKind::Spot);
    assert_eq!(renderer.shadow_maps().retired_count(), 1);
}
