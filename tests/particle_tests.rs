//! Particle Tests
//!
//! Tests for:
//! - Host-side emission, staged by the next recorded frame
//! - Capacity across staged and resident particles
//! - Sampled attribute ranges

use std::sync::Arc;

use glam::{Vec3, Vec4};

use ember::gpu::Command;
use ember::particles::{GPU_PARTICLE_SIZE, GpuParticle};
use ember::{
    HeadlessDevice, ParticleEmitter, Renderer, RendererSettings, SceneStore, VirtualWindow,
    WindowProvider,
};

fn renderer(max_particles: u32) -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = RendererSettings {
        headless_extent: (64, 64),
        shadow_map_resolution: 64,
        max_particles,
        ..Default::default()
    };
    Renderer::new(HeadlessDevice::new(), settings, Arc::new(SceneStore::new()), None)
        .expect("headless renderer")
}

fn emitter(number: u32) -> ParticleEmitter {
    ParticleEmitter {
        number,
        position_range: [Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 2.0, 1.0)],
        size_range: [0.1, 0.2],
        color_range: [Vec4::new(1.0, 0.5, 0.0, 1.0), Vec4::ONE],
        speed_range: [2.0, 4.0],
        duration_range: [1.0, 3.0],
        ..Default::default()
    }
}

#[test]
fn emitted_particles_move_on_the_next_frame() {
    let mut renderer = renderer(256);
    assert_eq!(renderer.emit_particles(&emitter(40)).unwrap(), 40);
    assert_eq!(renderer.particles().pending(), 40);
    assert_eq!(renderer.particles().resident(), 0);

    renderer.update(0.016).unwrap();
    assert_eq!(renderer.particles().pending(), 0);
    assert_eq!(renderer.particles().resident(), 40);

    let frame = renderer
        .device()
        .submissions()
        .iter()
        .rev()
        .find(|s| s.commands.label == "Frame")
        .unwrap();
    let copies: Vec<u64> = frame
        .commands
        .iter()
        .take_while(|c| !matches!(c, Command::DebugMarker(_)))
        .filter_map(|c| match c {
            Command::CopyBuffer { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(
        copies,
        vec![40 * GPU_PARTICLE_SIZE, 40 * GPU_PARTICLE_SIZE],
        "staging copy then ping-pong copy, ahead of every pass"
    );
}

#[test]
fn staging_is_written_only_by_the_recording_slot() {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = RendererSettings {
        shadow_map_resolution: 64,
        max_particles: 64,
        ..Default::default()
    };
    let window: Arc<dyn WindowProvider> = Arc::new(VirtualWindow::new(64, 64));
    let mut renderer = Renderer::new(
        HeadlessDevice::new(),
        settings,
        Arc::new(SceneStore::new()),
        Some(window),
    )
    .expect("windowed renderer");
    let staged_bytes = |r: &Renderer<HeadlessDevice>, slot: usize| {
        r.device()
            .buffer_bytes(r.particles().staging_buffer(slot))
            .unwrap()
            .to_vec()
    };

    // slot 0 records first, so emit while slot 1 is next
    renderer.update(0.016).unwrap();
    assert_eq!(renderer.scheduler().current_slot(), 1);
    renderer.emit_particles(&emitter(8)).unwrap();
    for slot in 0..2 {
        assert!(
            staged_bytes(&renderer, slot).iter().all(|&b| b == 0),
            "emission must not touch slot {slot} before its fence is waited on"
        );
    }

    renderer.update(0.016).unwrap();
    assert!(staged_bytes(&renderer, 0).iter().all(|&b| b == 0));
    let slot1 = staged_bytes(&renderer, 1);
    let first: GpuParticle =
        bytemuck::pod_read_unaligned(&slot1[..GPU_PARTICLE_SIZE as usize]);
    assert!((2.0..=4.0).contains(&first.speed));
    assert_eq!(renderer.particles().resident(), 8);
}

#[test]
fn residents_accumulate_and_buffers_swap() {
    let mut renderer = renderer(256);
    let input = renderer.particles().input_buffer();
    renderer.emit_particles(&emitter(10)).unwrap();
    renderer.update(0.016).unwrap();
    renderer.emit_particles(&emitter(5)).unwrap();
    renderer.update(0.016).unwrap();

    assert_eq!(renderer.particles().resident(), 15);
    assert_eq!(renderer.particles().input_buffer(), input, "two swaps return to the start");
}

#[test]
fn capacity_counts_staged_particles() {
    let mut renderer = renderer(64);
    assert_eq!(renderer.emit_particles(&emitter(50)).unwrap(), 50);
    assert_eq!(renderer.emit_particles(&emitter(50)).unwrap(), 14);
    assert_eq!(renderer.emit_particles(&emitter(1)).unwrap(), 0);
    assert_eq!(renderer.particles().reserved(), 64);

    renderer.update(0.016).unwrap();
    assert_eq!(renderer.particles().resident(), 64);
    assert_eq!(renderer.emit_particles(&emitter(1)).unwrap(), 0);
}

#[test]
fn sampled_attributes_stay_in_range() {
    let mut renderer = renderer(128);
    renderer.emit_particles(&emitter(100)).unwrap();
    renderer.update(0.016).unwrap();

    let buffer = renderer.particles().output_buffer();
    let bytes = renderer.device().buffer_bytes(buffer).unwrap();
    for chunk in bytes.chunks_exact(GPU_PARTICLE_SIZE as usize).take(100) {
        let p: GpuParticle = bytemuck::pod_read_unaligned(chunk);
        assert!((-1.0..=1.0).contains(&p.position[0]));
        assert!((0.0..=2.0).contains(&p.position[1]));
        assert!((0.1..=0.2).contains(&p.size));
        assert!((0.5..=1.0).contains(&p.color[1]));
        assert!((2.0..=4.0).contains(&p.speed));
        assert!((1.0..=3.0).contains(&p.duration));
        let direction = Vec3::from(p.direction);
        assert!((direction.length() - 1.0).abs() < 1e-4);
    }
}
