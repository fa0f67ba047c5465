//! UI Compositing Tests
//!
//! Tests for:
//! - Font and UI texture deduplication
//! - Submission-order batching across primitive kinds
//! - Glyph records written to the slot's glyph buffer
//! - Glyph capacity truncation
//! - Unknown fonts and images

use std::sync::Arc;

use glam::{Vec2, Vec4};
use rustc_hash::FxHashMap;

use ember::gpu::{Command, SubmissionRecord};
use ember::passes::ui::GpuGlyph;
use ember::resources::ImageId;
use ember::{
    Font, FontId, Glyph, HeadlessDevice, Image, ImageFormat, RenderError, Renderer,
    RendererSettings, SamplerFilter, SceneStore, UiPrimitiveKind,
};

const EPSILON: f32 = 1e-5;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn settings() -> RendererSettings {
    RendererSettings {
        headless_extent: (200, 100),
        shadow_map_resolution: 64,
        max_particles: 64,
        ..Default::default()
    }
}

fn renderer_with(settings: RendererSettings) -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Renderer::new(
        HeadlessDevice::new(),
        settings,
        Arc::new(SceneStore::new()),
        None,
    )
    .expect("headless renderer")
}

/// Monospace font with 10x10 glyphs for `a` through `d`.
fn test_font() -> Arc<Font> {
    let mut glyphs = FxHashMap::default();
    for (i, c) in ['a', 'b', 'c', 'd'].into_iter().enumerate() {
        let u = i as f32 * 0.25;
        glyphs.insert(
            c,
            Glyph {
                offset: Vec2::ZERO,
                size: Vec2::splat(10.0),
                advance: 10.0,
                uv_min: Vec2::new(u, 0.0),
                uv_max: Vec2::new(u + 0.25, 1.0),
            },
        );
    }
    let atlas = Arc::new(Image::new(4, 1, ImageFormat::R8, vec![255; 4]).linear());
    Arc::new(Font::new(atlas, glyphs, 12.0))
}

fn last_frame(device: &HeadlessDevice) -> &SubmissionRecord {
    device
        .submissions()
        .iter()
        .rev()
        .find(|s| s.commands.label == "Frame")
        .expect("no frame submitted")
}

fn ui_draw_counts(record: &SubmissionRecord) -> Vec<u32> {
    let mut in_ui = false;
    let mut counts = Vec::new();
    for command in record.commands.iter() {
        match command {
            Command::DebugMarker(name) => in_ui = *name == "UI Pass" || name.starts_with("UI "),
            Command::Draw { vertex_count } if in_ui => counts.push(*vertex_count),
            _ => {}
        }
    }
    counts
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn fonts_load_once_per_source() {
    let mut renderer = renderer_with(settings());
    let font = test_font();
    let a = renderer.load_font(&font).unwrap();
    let b = renderer.load_font(&font).unwrap();
    assert_eq!(a, b);
    assert_eq!(renderer.ui().font_count(), 1);

    let c = renderer.load_font(&test_font()).unwrap();
    assert_eq!(c, FontId(1));
}

#[test]
fn font_capacity_is_enforced() {
    let mut renderer = renderer_with(RendererSettings {
        max_fonts: 1,
        ..settings()
    });
    renderer.load_font(&test_font()).unwrap();
    assert!(matches!(
        renderer.load_font(&test_font()),
        Err(RenderError::CapacityExceeded { .. })
    ));
}

#[test]
fn ui_textures_are_keyed_by_image_and_filter() {
    let mut renderer = renderer_with(settings());
    let image = renderer
        .load_image(&Arc::new(Image::solid(4, 4, [255; 4])))
        .unwrap();
    let at = Vec2::new(50.0, 50.0);
    for filter in [SamplerFilter::Linear, SamplerFilter::Linear, SamplerFilter::Nearest] {
        renderer
            .draw_ui_image(image, filter, at, 0.0, Vec2::ONE, Vec4::ONE)
            .unwrap();
    }
    assert_eq!(renderer.ui().texture_count(), 2);
    assert_eq!(renderer.ui().queued(), 3);
}

#[test]
fn unknown_ids_are_rejected() {
    let mut renderer = renderer_with(settings());
    assert!(matches!(
        renderer.draw_ui_text(FontId(3), "a", Vec2::ZERO, Vec4::ONE),
        Err(RenderError::UnknownResource { kind: "font", .. })
    ));
    assert!(matches!(
        renderer.draw_ui_image(
            ImageId(999),
            SamplerFilter::Linear,
            Vec2::ZERO,
            0.0,
            Vec2::ONE,
            Vec4::ONE
        ),
        Err(RenderError::UnknownResource { kind: "image", .. })
    ));
    assert!(renderer.ui().is_idle());
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn primitives_draw_in_submission_order() {
    let mut renderer = renderer_with(settings());
    let font = renderer.load_font(&test_font()).unwrap();
    let image = renderer
        .load_image(&Arc::new(Image::solid(8, 8, [0, 255, 0, 255])))
        .unwrap();

    renderer.draw_ui_rectangle(Vec2::ZERO, Vec2::new(20.0, 10.0), Vec4::ONE);
    renderer
        .draw_ui_text(font, "abc", Vec2::new(10.0, 10.0), Vec4::ONE)
        .unwrap();
    renderer
        .draw_ui_image(image, SamplerFilter::Nearest, Vec2::splat(40.0), 0.5, Vec2::ONE, Vec4::ONE)
        .unwrap();
    renderer.draw_ui_line(Vec2::ZERO, Vec2::new(200.0, 100.0), Vec4::ONE);
    renderer.update(0.016).unwrap();

    assert_eq!(
        renderer.ui().last_drawn(),
        vec![
            UiPrimitiveKind::Rectangle,
            UiPrimitiveKind::Text,
            UiPrimitiveKind::Image,
            UiPrimitiveKind::Line,
        ]
    );
    assert!(renderer.ui().is_idle(), "queues drain every frame");
    assert_eq!(ui_draw_counts(last_frame(renderer.device())), vec![6, 18, 6, 2]);
}

#[test]
fn next_frame_starts_empty() {
    let mut renderer = renderer_with(settings());
    renderer.draw_ui_line(Vec2::ZERO, Vec2::ONE, Vec4::ONE);
    renderer.update(0.016).unwrap();
    renderer.update(0.016).unwrap();
    assert!(renderer.ui().last_drawn().is_empty());
    assert!(ui_draw_counts(last_frame(renderer.device())).is_empty());
}

#[test]
fn glyphs_are_written_in_clip_space() {
    let mut renderer = renderer_with(settings());
    let font = renderer.load_font(&test_font()).unwrap();
    renderer
        .draw_ui_text(font, "ab", Vec2::new(50.0, 25.0), Vec4::ONE)
        .unwrap();
    renderer.update(0.016).unwrap();

    let buffer = renderer.scheduler().slot(0).buffers.ui_text;
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    let size = std::mem::size_of::<GpuGlyph>();
    let first: GpuGlyph = bytemuck::pod_read_unaligned(&bytes[..size]);
    let second: GpuGlyph = bytemuck::pod_read_unaligned(&bytes[size..2 * size]);

    // 200x100 target: x = 50 -> -0.5, y = 25 -> 0.5
    assert!(approx(first.top_left[0], -0.5) && approx(first.top_left[1], 0.5));
    assert!(approx(first.bottom_right[0], -0.4) && approx(first.bottom_right[1], 0.3));
    assert!(approx(second.top_left[0], -0.4), "pen advances one glyph");
    assert!(approx(second.uv_min[0], 0.25));
}

#[test]
fn text_past_glyph_capacity_is_truncated() {
    let mut renderer = renderer_with(RendererSettings {
        max_ui_glyphs: 5,
        ..settings()
    });
    let font = renderer.load_font(&test_font()).unwrap();
    renderer
        .draw_ui_text(font, "abc", Vec2::ZERO, Vec4::ONE)
        .unwrap();
    renderer
        .draw_ui_text(font, "dcba", Vec2::ZERO, Vec4::ONE)
        .unwrap();
    renderer
        .draw_ui_text(font, "ab", Vec2::ZERO, Vec4::ONE)
        .unwrap();
    renderer.update(0.016).unwrap();

    assert_eq!(renderer.ui().last_drawn().len(), 3, "empty text keeps its slot");
    assert_eq!(ui_draw_counts(last_frame(renderer.device())), vec![18, 12]);
}

#[test]
fn text_without_known_glyphs_draws_nothing() {
    let mut renderer = renderer_with(settings());
    let font = renderer.load_font(&test_font()).unwrap();
    renderer
        .draw_ui_text(font, "xyz", Vec2::ZERO, Vec4::ONE)
        .unwrap();
    renderer.update(0.016).unwrap();
    assert_eq!(renderer.ui().last_drawn(), vec![UiPrimitiveKind::Text]);
    assert!(ui_draw_counts(last_frame(renderer.device())).is_empty());
}
