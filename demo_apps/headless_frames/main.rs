//! Renders a rotating cube over a ground plane without a window.
//!
//! The scene has a shadow-casting sun, a spot light and a burst of
//! particles, with a text and rectangle overlay drawn every frame. Built
//! with `--features gpu` it runs on a real adapter; otherwise on the
//! in-memory device, which also reports what each frame submitted.
//!
//! ```text
//! RUST_LOG=info cargo run -p headless_frames -- 120
//! ```

use std::sync::Arc;

use glam::{Quat, Vec2, Vec3, Vec4};
use log::info;
use rustc_hash::FxHashMap;

use ember::module::RenderModule;
use ember::{
    Camera, ComponentKind, Entity, Font, Glyph, GpuDevice, GraphicsModule, Image, ImageFormat, Light,
    Material, Mesh, ParticleEmitter, Renderable, RendererSettings, SceneStore, TextureRef,
    Transform, Vertex,
};

const DEFAULT_FRAMES: u32 = 60;
const DT: f64 = 1.0 / 60.0;

/// Axis-aligned box centered on the origin, four vertices per face.
fn box_mesh(size: f32) -> Mesh {
    let h = size * 0.5;
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, right, up) in faces {
        let base = vertices.len() as u32;
        let center = normal * h;
        for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
            let p = center + right * h * (u * 2.0 - 1.0) + up * h * (1.0 - v * 2.0);
            let mut vertex = Vertex::new(p.to_array(), normal.to_array(), [u, v]);
            vertex.tangent = right.extend(1.0).to_array();
            vertices.push(vertex);
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    Mesh::new(vertices, indices)
}

fn ground_mesh(extent: f32) -> Mesh {
    let h = extent * 0.5;
    let n = [0.0, 1.0, 0.0];
    let mut vertices = vec![
        Vertex::new([-h, 0.0, h], n, [0.0, 1.0]),
        Vertex::new([h, 0.0, h], n, [1.0, 1.0]),
        Vertex::new([h, 0.0, -h], n, [1.0, 0.0]),
        Vertex::new([-h, 0.0, -h], n, [0.0, 0.0]),
    ];
    for v in &mut vertices {
        v.tangent = [1.0, 0.0, 0.0, 1.0];
    }
    Mesh::new(vertices, vec![0, 1, 2, 0, 2, 3])
}

/// Checkerboard used as the cube's diffuse texture.
fn checker(size: u32) -> Image {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / 8) + (y / 8)) % 2 == 0;
            pixels.extend(if on { [230, 90, 60, 255] } else { [250, 240, 230, 255] });
        }
    }
    Image::new(size, size, ImageFormat::Rgba8, pixels)
}

/// Block font covering the digits and a few letters; every glyph samples
/// the same solid atlas.
fn block_font() -> Font {
    let glyph = Glyph {
        offset: Vec2::ZERO,
        size: Vec2::new(8.0, 12.0),
        advance: 10.0,
        uv_min: Vec2::ZERO,
        uv_max: Vec2::ONE,
    };
    let glyphs: FxHashMap<char, Glyph> = ('0'..='9')
        .chain("FRAME:".chars())
        .map(|c| (c, glyph))
        .collect();
    let atlas = Image::new(1, 1, ImageFormat::R8, vec![255]).linear();
    Font::new(Arc::new(atlas), glyphs, 14.0)
}

struct Demo {
    scene: Arc<SceneStore>,
    cube: Entity,
}

impl Demo {
    fn build(module: &mut dyn GraphicsModule, scene: Arc<SceneStore>) -> anyhow::Result<Self> {
        let cube = scene.spawn();
        scene.set_transform(cube, Transform::from_position(Vec3::new(0.0, 1.0, 0.0)));
        scene.set_renderable(
            cube,
            Renderable {
                mesh: Some(Arc::new(box_mesh(1.5))),
                material: Arc::new(Material {
                    diffuse: TextureRef::new(Arc::new(checker(64))),
                    ..Material::default()
                }),
            },
        );
        module.on_component_added(cube, ComponentKind::Renderable)?;

        let ground = scene.spawn();
        scene.set_transform(ground, Transform::default());
        scene.set_renderable(
            ground,
            Renderable {
                mesh: Some(Arc::new(ground_mesh(30.0))),
                material: Arc::new(Material::default()),
            },
        );
        module.on_component_added(ground, ComponentKind::Renderable)?;

        let sun = scene.spawn();
        scene.set_transform(
            sun,
            Transform::looking_along(Vec3::new(8.0, 12.0, 6.0), Vec3::new(-8.0, -12.0, -6.0)),
        );
        scene.set_light(sun, Light::directional(Vec3::ONE, 4.0));
        module.on_component_added(sun, ComponentKind::Light)?;

        let spot = scene.spawn();
        scene.set_transform(
            spot,
            Transform::looking_along(Vec3::new(-3.0, 5.0, 2.0), Vec3::new(3.0, -5.0, -2.0)),
        );
        scene.set_light(
            spot,
            Light::spot(Vec3::new(0.4, 0.6, 1.0), 30.0, 0.3, 0.45),
        );
        module.on_component_added(spot, ComponentKind::Light)?;

        let camera = scene.spawn();
        scene.set_transform(
            camera,
            Transform::looking_along(Vec3::new(6.0, 4.5, 6.0), Vec3::new(-6.0, -3.5, -6.0)),
        );
        scene.set_camera(camera, Camera::default());
        module.on_component_added(camera, ComponentKind::Camera)?;

        Ok(Self { scene, cube })
    }

    fn animate(&self, t: f32) {
        let mut transform = Transform::from_position(Vec3::new(0.0, 1.0 + 0.25 * t.sin(), 0.0));
        transform.rotation = Quat::from_rotation_y(1.2 * t);
        self.scene.set_transform(self.cube, transform);
    }
}

fn run<D: GpuDevice + 'static>(device: D, frames: u32) -> anyhow::Result<RenderModule<D>> {
    let scene = Arc::new(SceneStore::new());
    let settings = RendererSettings {
        headless_extent: (640, 360),
        shadow_map_resolution: 1024,
        ..Default::default()
    };
    let mut module = RenderModule::new(device, settings, scene.clone(), None);
    module.init()?;

    let demo = Demo::build(&mut module, scene)?;
    let font = module.load_font(&Arc::new(block_font()))?;
    module.emit_particles(&ParticleEmitter {
        number: 2_000,
        position_range: [Vec3::new(-0.5, 2.0, -0.5), Vec3::new(0.5, 2.2, 0.5)],
        size_range: [0.02, 0.06],
        color_range: [Vec4::new(1.0, 0.6, 0.1, 1.0), Vec4::new(1.0, 0.9, 0.3, 1.0)],
        rotation_range: [Vec3::new(-0.4, -3.1, 0.0), Vec3::new(0.4, 3.1, 0.0)],
        base_direction: Vec3::Y,
        speed_range: [0.5, 2.0],
        duration_range: [1.0, 3.0],
    })?;

    for frame in 0..frames {
        demo.animate(frame as f32 * DT as f32);
        module.draw_ui_rectangle(
            Vec2::new(8.0, 8.0),
            Vec2::new(150.0, 24.0),
            Vec4::new(0.0, 0.0, 0.0, 0.6),
        )?;
        module.draw_ui_text(font, &format!("FRAME:{frame}"), Vec2::new(14.0, 14.0), Vec4::ONE)?;
        module.update(DT)?;
    }

    if let Some(renderer) = module.renderer() {
        info!(
            "Rendered {} frames at {}x{}: {} objects, {} materials, {} shadow maps, {} particles",
            renderer.scheduler().frames_begun(),
            renderer.draw_extent().width,
            renderer.draw_extent().height,
            renderer.objects().len(),
            renderer.materials().len(),
            renderer.shadow_maps().len(),
            renderer.particles().resident(),
        );
    }
    module.destroy()?;
    Ok(module)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let frames = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => DEFAULT_FRAMES,
    };

    #[cfg(feature = "gpu")]
    {
        run(ember::WgpuDevice::headless()?, frames)?;
    }

    #[cfg(not(feature = "gpu"))]
    {
        let module = run(ember::HeadlessDevice::new(), frames)?;
        if let Some(device) = module.device() {
            let commands: usize = device
                .submissions()
                .iter()
                .map(|s| s.commands.commands.len())
                .sum();
            info!(
                "{} submissions, {commands} commands, {} device objects left",
                device.submissions().len(),
                device.live_objects(),
            );
        }
    }
    Ok(())
}
