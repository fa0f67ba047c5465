//! Resource Registry Tests
//!
//! Tests for:
//! - Object slots through the renderable lifecycle (allocate, reuse, cap)
//! - Per-frame object records
//! - Material deduplication and texture resolution
//! - Image and mesh load deduplication, mip chains, malformed assets
//! - Light buffer header

use std::sync::Arc;

use glam::Vec3;

use ember::resources::{DEFAULT_TEXTURE_COUNT, GpuObject};
use ember::{
    ComponentKind, Entity, HeadlessDevice, Image, ImageFormat, Light, Material, Mesh,
    RenderError, Renderable, Renderer, RendererSettings, SceneStore, TextureRef, Transform,
    Vertex,
};

fn small_settings() -> RendererSettings {
    RendererSettings {
        headless_extent: (160, 90),
        shadow_map_resolution: 64,
        max_particles: 64,
        ..Default::default()
    }
}

fn renderer_with(settings: RendererSettings) -> (Arc<SceneStore>, Renderer<HeadlessDevice>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let scene = Arc::new(SceneStore::new());
    let renderer = Renderer::new(HeadlessDevice::new(), settings, scene.clone(), None)
        .expect("headless renderer");
    (scene, renderer)
}

fn quad() -> Arc<Mesh> {
    let n = [0.0, 0.0, 1.0];
    Arc::new(Mesh::new(
        vec![
            Vertex::new([-1.0, -1.0, 0.0], n, [0.0, 1.0]),
            Vertex::new([1.0, -1.0, 0.0], n, [1.0, 1.0]),
            Vertex::new([1.0, 1.0, 0.0], n, [1.0, 0.0]),
            Vertex::new([-1.0, 1.0, 0.0], n, [0.0, 0.0]),
        ],
        vec![0, 1, 2, 0, 2, 3],
    ))
}

fn spawn_renderable(
    renderer: &mut Renderer<HeadlessDevice>,
    scene: &SceneStore,
    position: Vec3,
    mesh: Option<Arc<Mesh>>,
    material: Material,
) -> Result<Entity, RenderError> {
    let entity = scene.spawn();
    scene.set_transform(entity, Transform::from_position(position));
    scene.set_renderable(
        entity,
        Renderable {
            mesh,
            material: Arc::new(material),
        },
    );
    renderer.on_component_added(entity, ComponentKind::Renderable)?;
    Ok(entity)
}

fn despawn_renderable(renderer: &mut Renderer<HeadlessDevice>, scene: &SceneStore, entity: Entity) {
    scene.remove(entity, ComponentKind::Renderable);
    renderer
        .on_component_removed(entity, ComponentKind::Renderable)
        .unwrap();
}

// ============================================================================
// Object Slots
// ============================================================================

#[test]
fn removed_slots_are_reused_smallest_first() {
    let (scene, mut renderer) = renderer_with(small_settings());
    let entities: Vec<Entity> = (0..4)
        .map(|i| {
            spawn_renderable(&mut renderer, &scene, Vec3::X * i as f32, None, Material::default())
                .unwrap()
        })
        .collect();
    let slot_of = |r: &Renderer<HeadlessDevice>, e| r.objects().get(e).map(|o| o.slot);
    assert_eq!(slot_of(&renderer, entities[3]), Some(3));

    despawn_renderable(&mut renderer, &scene, entities[2]);
    despawn_renderable(&mut renderer, &scene, entities[0]);
    assert_eq!(renderer.objects().len(), 2);

    let a = spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    let b = spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    let c = spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    assert_eq!(slot_of(&renderer, a), Some(0));
    assert_eq!(slot_of(&renderer, b), Some(2));
    assert_eq!(slot_of(&renderer, c), Some(4), "high-water grows only when nothing is free");
}

#[test]
fn object_capacity_is_enforced() {
    let (scene, mut renderer) = renderer_with(RendererSettings {
        max_objects: 2,
        ..small_settings()
    });
    spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    let third = spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default());
    assert!(
        matches!(third, Err(RenderError::CapacityExceeded { capacity: 2, .. })),
        "third object should exceed capacity, got {third:?}"
    );
}

#[test]
fn object_records_land_at_their_slot() {
    let (scene, mut renderer) = renderer_with(small_settings());
    spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    let glowing = Material {
        emissive_factor: 2.0,
        ..Material::default()
    };
    let entity =
        spawn_renderable(&mut renderer, &scene, Vec3::new(4.0, 5.0, 6.0), None, glowing).unwrap();
    renderer.update(0.016).unwrap();

    let slot = renderer.objects().get(entity).unwrap().slot;
    let buffer = renderer.scheduler().slot(0).buffers.objects;
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    let offset = (u64::from(slot) * GpuObject::SIZE) as usize;
    let record: GpuObject =
        bytemuck::pod_read_unaligned(&bytes[offset..offset + GpuObject::SIZE as usize]);

    assert_eq!(&record.model[3][..3], &[4.0, 5.0, 6.0]);
    assert_eq!(record.material_index, 1);
}

#[test]
fn moved_transforms_show_up_next_frame() {
    let (scene, mut renderer) = renderer_with(small_settings());
    let entity =
        spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    renderer.update(0.016).unwrap();
    scene.set_transform(entity, Transform::from_position(Vec3::new(0.0, 7.0, 0.0)));
    renderer.update(0.016).unwrap();

    let buffer = renderer.scheduler().slot(0).buffers.objects;
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    let record: GpuObject = bytemuck::pod_read_unaligned(&bytes[..GpuObject::SIZE as usize]);
    assert_eq!(record.model[3][1], 7.0);
}

// ============================================================================
// Materials and Textures
// ============================================================================

#[test]
fn equal_materials_share_an_index() {
    let (scene, mut renderer) = renderer_with(small_settings());
    for _ in 0..3 {
        spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, Material::default()).unwrap();
    }
    assert_eq!(renderer.materials().len(), 1);

    let cutout = Material {
        alpha_cutoff: 0.1,
        ..Material::default()
    };
    spawn_renderable(&mut renderer, &scene, Vec3::ZERO, None, cutout).unwrap();
    assert_eq!(renderer.materials().len(), 2);
}

#[test]
fn material_textures_resolve_once() {
    let (_, mut renderer) = renderer_with(small_settings());
    let image = Arc::new(Image::solid(8, 8, [200, 10, 10, 255]));
    let material = Material {
        diffuse: TextureRef::new(image.clone()),
        emissive: TextureRef::new(image),
        ..Material::default()
    };

    let first = renderer.load_material(&material).unwrap();
    let second = renderer.load_material(&material.clone()).unwrap();
    assert_eq!(first, second);

    let gpu = renderer.materials().get(first).unwrap();
    assert_eq!(gpu.diffuse, DEFAULT_TEXTURE_COUNT);
    assert_eq!(gpu.emissive, gpu.diffuse, "same image and sampler share a slot");
    assert_eq!(renderer.textures().texture_count(), DEFAULT_TEXTURE_COUNT as usize + 1);
}

#[test]
fn missing_textures_fall_back_to_defaults() {
    let (_, mut renderer) = renderer_with(small_settings());
    let index = renderer.load_material(&Material::default()).unwrap();
    let gpu = renderer.materials().get(index).unwrap();
    assert!(gpu.diffuse < DEFAULT_TEXTURE_COUNT);
    assert!(gpu.normal < DEFAULT_TEXTURE_COUNT);
    assert_ne!(gpu.diffuse, gpu.normal);
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn same_image_source_loads_once() {
    let (_, mut renderer) = renderer_with(small_settings());
    let image = Arc::new(Image::solid(16, 4, [0, 0, 0, 255]));
    let before = renderer.device().live_images();
    let loaded_before = renderer.textures().image_count();

    let a = renderer.load_image(&image).unwrap();
    let b = renderer.load_image(&image).unwrap();
    assert_eq!(a, b);
    assert_eq!(renderer.device().live_images(), before + 1);
    assert_eq!(renderer.textures().image_count(), loaded_before + 1);

    let loaded = *renderer.textures().get(a).unwrap();
    let (_, _, _, mips) = renderer.device().image_shape(loaded.image).unwrap();
    assert_eq!(mips, 3, "the chain stops at the short side");
    for mip in 0..mips {
        assert!(renderer.device().mip_written(loaded.image, 0, mip));
    }
}

#[test]
fn malformed_image_is_rejected() {
    let (_, mut renderer) = renderer_with(small_settings());
    let image = Arc::new(Image::new(4, 4, ImageFormat::Rgba8, vec![0; 10]));
    assert!(matches!(
        renderer.load_image(&image),
        Err(RenderError::InvalidAsset(_))
    ));
}

#[test]
fn meshes_share_the_arena() {
    let (_, mut renderer) = renderer_with(small_settings());
    let mesh = quad();
    let a = renderer.load_mesh(&mesh).unwrap();
    let b = renderer.load_mesh(&mesh).unwrap();
    let c = renderer.load_mesh(&quad()).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);

    let first = renderer.geometry().range(a).unwrap();
    let second = renderer.geometry().range(c).unwrap();
    assert_eq!(first.index_count, 6);
    assert_eq!(second.first_index, first.first_index + 6);
}

#[test]
fn empty_mesh_draws_the_default_mesh() {
    let (scene, mut renderer) = renderer_with(small_settings());
    let empty = Arc::new(Mesh::new(Vec::new(), Vec::new()));
    let entity =
        spawn_renderable(&mut renderer, &scene, Vec3::ZERO, Some(empty), Material::default())
            .unwrap();
    assert_eq!(
        renderer.objects().get(entity).map(|o| o.mesh),
        Some(renderer.default_mesh())
    );
}

#[test]
fn out_of_range_indices_are_rejected() {
    let (_, mut renderer) = renderer_with(small_settings());
    let n = [0.0, 0.0, 1.0];
    let mesh = Arc::new(Mesh::new(
        vec![Vertex::new([0.0; 3], n, [0.0; 2]); 3],
        vec![0, 1, 3],
    ));
    assert!(matches!(
        renderer.load_mesh(&mesh),
        Err(RenderError::InvalidAsset(_))
    ));
}

// ============================================================================
// Lights
// ============================================================================

#[test]
fn light_header_counts_each_kind() {
    let (scene, mut renderer) = renderer_with(small_settings());
    let lights = [
        Light::directional(Vec3::ONE, 1.0),
        Light::point(Vec3::ONE, 1.0),
        Light::point(Vec3::ONE, 1.0),
        Light::spot(Vec3::ONE, 1.0, 0.2, 0.4),
    ];
    for light in lights {
        let entity = scene.spawn();
        scene.set_transform(entity, Transform::from_position(Vec3::Y));
        scene.set_light(entity, light);
        renderer
            .on_component_added(entity, ComponentKind::Light)
            .unwrap();
    }
    renderer.update(0.016).unwrap();

    let buffer = renderer.scheduler().slot(0).buffers.lights;
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    let header: [u32; 4] = bytemuck::pod_read_unaligned(&bytes[..16]);
    assert_eq!(header, [1, 2, 1, 1]);
}
