//! Frame Scheduling Tests
//!
//! Tests for:
//! - Frames in flight and slot rotation (headless and windowed)
//! - Pass order inside a recorded frame
//! - Lazy per-slot binding rewrites after registry growth
//! - Tone mapping constants
//! - Out-of-date output recovery and zero-area windows
//! - Closed windows
//! - Module lifecycle and teardown accounting

use std::sync::Arc;

use glam::Vec3;

use ember::gpu::{Command, Extent, SubmissionRecord};
use ember::{
    Camera, ComponentKind, DirtyFlags, GraphicsModule, HeadlessDevice, Image, Material,
    RenderError, Renderer, RendererSettings, SceneStore, TextureRef, ToneMapMode,
    ToneMapSettings, Transform, VirtualWindow, WindowProvider, create_module,
};

fn small_settings() -> RendererSettings {
    RendererSettings {
        headless_extent: (160, 90),
        shadow_map_resolution: 64,
        max_particles: 64,
        ..Default::default()
    }
}

fn headless(scene: &Arc<SceneStore>) -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), None)
        .expect("headless renderer")
}

fn windowed(scene: &Arc<SceneStore>, window: &VirtualWindow) -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    let provider: Arc<dyn WindowProvider> = Arc::new(window.clone());
    Renderer::new(HeadlessDevice::new(), small_settings(), scene.clone(), Some(provider))
        .expect("windowed renderer")
}

fn frame_submissions(device: &HeadlessDevice) -> Vec<&SubmissionRecord> {
    device
        .submissions()
        .iter()
        .filter(|s| s.commands.label == "Frame")
        .collect()
}

fn markers(record: &SubmissionRecord) -> Vec<&'static str> {
    record
        .commands
        .iter()
        .filter_map(|c| match c {
            Command::DebugMarker(name) => Some(*name),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Slot Rotation
// ============================================================================

#[test]
fn headless_runs_one_frame_in_flight() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer = headless(&scene);
    assert_eq!(renderer.frames_in_flight(), 1);
    assert!(!renderer.scheduler().is_windowed());

    for _ in 0..3 {
        renderer.update(0.016).unwrap();
        assert_eq!(renderer.scheduler().current_slot(), 0);
    }
    assert_eq!(renderer.scheduler().frames_begun(), 3);
    assert_eq!(frame_submissions(renderer.device()).len(), 3);
    assert_eq!(renderer.device().presented_frames(), 0, "headless never presents");
}

#[test]
fn default_headless_target_is_720p() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut renderer = Renderer::new(
        HeadlessDevice::new(),
        RendererSettings::default(),
        Arc::new(SceneStore::new()),
        None,
    )
    .unwrap();
    assert_eq!(renderer.draw_extent(), Extent::new(1280, 720));
    assert_eq!(renderer.scheduler().output_extent(), Extent::new(1280, 720));
    renderer.update(0.016).unwrap();
}

#[test]
fn windowed_rotates_two_slots() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(200, 100);
    let mut renderer = windowed(&scene, &window);
    assert_eq!(renderer.frames_in_flight(), 2);

    let mut visited = Vec::new();
    for _ in 0..4 {
        visited.push(renderer.scheduler().current_slot());
        renderer.update(0.016).unwrap();
    }
    assert_eq!(visited, vec![0, 1, 0, 1]);
    assert_eq!(renderer.device().presented_frames(), 4);
}

#[test]
fn windowed_frames_wait_and_signal_semaphores() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(64, 64);
    let mut renderer = windowed(&scene, &window);
    renderer.update(0.016).unwrap();

    let frames = frame_submissions(renderer.device());
    let frame = frames.last().unwrap();
    assert_eq!((frame.waits, frame.signals), (1, 1));
    assert!(frame.fenced);
}

#[test]
fn passes_record_in_fixed_order() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer = headless(&scene);
    renderer.update(0.016).unwrap();

    let frames = frame_submissions(renderer.device());
    let order: Vec<_> = markers(frames[0])
        .into_iter()
        .filter(|m| m.ends_with("Pass"))
        .collect();
    assert_eq!(order, ["Shadow Pass", "Main Pass", "Tone Map Pass", "UI Pass"]);
}

#[test]
fn first_frame_clears_its_dirty_flags() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer = headless(&scene);
    assert_eq!(renderer.scheduler().slot(0).dirty, DirtyFlags::all());
    renderer.update(0.016).unwrap();
    assert!(
        renderer.scheduler().slot(0).dirty.is_empty(),
        "every pass should have rewritten its tables, left {:?}",
        renderer.scheduler().slot(0).dirty
    );
}

#[test]
fn registry_growth_rebinds_each_slot_before_its_own_frame() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(160, 90);
    let mut renderer = windowed(&scene, &window);
    renderer.update(0.016).unwrap();
    renderer.update(0.016).unwrap();
    let dirty = |r: &Renderer<HeadlessDevice>| {
        [r.scheduler().slot(0).dirty, r.scheduler().slot(1).dirty]
    };
    assert_eq!(dirty(&renderer), [DirtyFlags::empty(); 2]);

    let material = Material {
        diffuse: TextureRef::new(Arc::new(Image::solid(8, 8, [40, 80, 120, 255]))),
        ..Material::default()
    };
    renderer.load_material(&material).unwrap();
    assert_eq!(dirty(&renderer), [DirtyFlags::MAIN_BINDINGS; 2]);

    assert_eq!(renderer.scheduler().current_slot(), 0);
    renderer.update(0.016).unwrap();
    assert_eq!(dirty(&renderer), [DirtyFlags::empty(), DirtyFlags::MAIN_BINDINGS]);

    renderer.update(0.016).unwrap();
    assert_eq!(dirty(&renderer), [DirtyFlags::empty(); 2]);
}

#[test]
fn tone_map_constants_follow_settings() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer = headless(&scene);
    renderer.tone_mapping_mut().settings = ToneMapSettings {
        exposure: 0.75,
        mode: ToneMapMode::Linear,
    };
    renderer.update(0.016).unwrap();

    let frames = frame_submissions(renderer.device());
    let recorded = frames[0]
        .commands
        .iter()
        .skip_while(|c| !matches!(c, Command::DebugMarker("Tone Map Pass")))
        .find_map(|c| match c {
            Command::SetConstants(constants) => Some(*constants),
            _ => None,
        })
        .expect("tone map pass sets constants");
    assert_eq!(recorded, renderer.tone_mapping().constants());
    assert_eq!(recorded.word(0), ToneMapMode::Linear.shader_id());
    assert_eq!(recorded.float(1), 0.75);
}

#[test]
fn pipelines_share_the_renderers_shader_templates() {
    let scene = Arc::new(SceneStore::new());
    let renderer = headless(&scene);
    let compiler = renderer.shader_compiler();
    let cached = compiler.cached_sources();
    assert!(cached >= 4, "every pass preprocesses its template at init");
    assert!(compiler.preprocess("main").is_some());
    assert_eq!(compiler.cached_sources(), cached, "templates render once");
}

#[test]
fn camera_uniforms_reach_the_slot_buffer() {
    let scene = Arc::new(SceneStore::new());
    let mut renderer = headless(&scene);
    let camera = scene.spawn();
    scene.set_transform(camera, Transform::from_position(Vec3::new(1.0, 2.0, 3.0)));
    scene.set_camera(camera, Camera::default());
    renderer
        .on_component_added(camera, ComponentKind::Camera)
        .unwrap();
    assert_eq!(renderer.main_camera(), Some(camera));

    renderer.update(0.016).unwrap();

    let buffer = renderer.scheduler().slot(0).buffers.camera;
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    let floats: [f32; 36] = bytemuck::pod_read_unaligned(&bytes[..36 * 4]);
    assert_eq!(&floats[32..35], &[1.0, 2.0, 3.0], "camera position follows the matrices");
}

// ============================================================================
// Output Recreation
// ============================================================================

#[test]
fn stale_output_rebuilds_at_window_size() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(200, 100);
    let mut renderer = windowed(&scene, &window);
    renderer.update(0.016).unwrap();

    window.resize(320, 240);
    renderer.device_mut().mark_output_stale();
    renderer.update(0.016).unwrap();

    assert_eq!(renderer.draw_extent(), Extent::new(320, 240));
    assert_eq!(renderer.scheduler().output_extent(), Extent::new(320, 240));
    assert!(
        renderer
            .scheduler()
            .slot(0)
            .dirty
            .contains(DirtyFlags::TONE_MAP_BINDINGS),
        "tone map must resample the rebuilt color target"
    );

    let presented = renderer.device().presented_frames();
    renderer.update(0.016).unwrap();
    assert_eq!(renderer.device().presented_frames(), presented + 1);
}

#[test]
fn resize_polls_through_zero_area() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(200, 100);
    let mut renderer = windowed(&scene, &window);

    window.resize(0, 0);
    window.queue_sizes(&[Extent::new(0, 50), Extent::new(0, 0), Extent::new(128, 64)]);
    renderer.device_mut().mark_output_stale();
    renderer.update(0.016).unwrap();

    assert_eq!(renderer.draw_extent(), Extent::new(128, 64));
}

#[test]
fn closed_window_skips_frames() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(200, 100);
    let mut renderer = windowed(&scene, &window);
    renderer.update(0.016).unwrap();

    window.close();
    renderer.update(0.016).unwrap();
    renderer.update(0.016).unwrap();

    assert_eq!(renderer.scheduler().frames_begun(), 1);
    assert_eq!(frame_submissions(renderer.device()).len(), 1);
}

#[test]
fn closed_window_fails_construction() {
    let window = VirtualWindow::new(0, 0);
    window.close();
    let provider: Arc<dyn WindowProvider> = Arc::new(window);
    let result = Renderer::new(
        HeadlessDevice::new(),
        small_settings(),
        Arc::new(SceneStore::new()),
        Some(provider),
    );
    assert!(matches!(result, Err(RenderError::WindowClosed)));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn destroy_releases_every_device_object() {
    let scene = Arc::new(SceneStore::new());
    let window = VirtualWindow::new(64, 48);
    let mut renderer = windowed(&scene, &window);
    for _ in 0..3 {
        renderer.update(0.016).unwrap();
    }
    let device = renderer.destroy().unwrap();
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn module_requires_init() {
    let scene = Arc::new(SceneStore::new());
    let mut module = create_module(HeadlessDevice::new(), small_settings(), scene, None);
    assert!(matches!(module.update(0.016), Err(RenderError::NotInitialized)));

    module.init().unwrap();
    module.update(0.016).unwrap();
    module.destroy().unwrap();

    assert!(matches!(module.update(0.016), Err(RenderError::NotInitialized)));
    module.destroy().unwrap();
}
