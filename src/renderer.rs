//! Renderer
//!
//! [`Renderer`] owns the device and every subsystem, and drives one frame per
//! [`Renderer::update`]:
//!
//! ```text
//! begin_frame ─► release retired shadow maps
//!             ─► write slot buffers (camera, objects, materials, lights)
//!             ─► fit shadow cascades, write matrix and cascade buffers
//!             ─► prepare (lazy binding rewrites) ─► record
//!                  particles ─► shadow ─► main ─► tone map ─► UI ─► output barrier
//! end_frame   ─► resize when the output went stale
//! ```
//!
//! Registries and uploads are touched only from the load and component
//! callbacks, never while a frame is being recorded.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use log::{debug, info, warn};

use crate::assets::{Font, Image, Material, Mesh, SamplerFilter};
use crate::errors::{RenderError, Result};
use crate::frame::{
    ActiveFrame, CameraUniforms, DirtyFlags, FrameEnd, FrameScheduler, FrameStart,
};
use crate::gpu::{
    DeviceInfo, Extent, GpuDevice, ImageBarrier, ImageLayout, ShaderCompiler, Uploader,
};
use crate::particles::{ParticleEmitter, ParticleSubsystem};
use crate::passes::{
    FontId, FrameContext, MainPass, ObjectDraw, RenderNode, RenderTargets, ToneMapPass,
    UiCompositor,
};
use crate::resources::{
    DEFAULT_SAMPLER_KEY, DefaultTexture, GeometryArena, GpuMaterial, GpuObject, ImageId,
    LightSets, MaterialRegistry, MeshId, ObjectTable, TextureRegistry,
};
use crate::scene::{ComponentKind, Entity, World};
use crate::settings::RendererSettings;
use crate::shadow::{
    CameraFrustum, ShadowBindings, ShadowMaps, ShadowPass, SpotShadowInput, compute_shadows,
    shadow_buffer_bytes,
};
use crate::window::WindowProvider;

pub struct Renderer<D: GpuDevice> {
    device: D,
    info: DeviceInfo,
    settings: RendererSettings,
    world: Arc<dyn World>,
    window: Option<Arc<dyn WindowProvider>>,

    scheduler: FrameScheduler,
    uploader: Uploader,
    geometry: GeometryArena,
    default_mesh: MeshId,
    textures: TextureRegistry,
    materials: MaterialRegistry,
    objects: ObjectTable,
    lights: LightSets,
    shadow_maps: ShadowMaps,

    shadow_pass: ShadowPass,
    main_pass: MainPass,
    tone_map: ToneMapPass,
    ui: UiCompositor,
    targets: RenderTargets,
    particles: ParticleSubsystem,

    main_camera: Option<Entity>,
    /// Kept for the renderer's lifetime; passes borrow it while building.
    compiler: Arc<ShaderCompiler>,
}

impl<D: GpuDevice> Renderer<D> {
    /// Allocates every device resource. Without a window the renderer draws
    /// into an offscreen image of `settings.headless_extent`.
    pub fn new(
        mut device: D,
        settings: RendererSettings,
        world: Arc<dyn World>,
        window: Option<Arc<dyn WindowProvider>>,
    ) -> Result<Self> {
        let info = device.info().clone();
        info!("Using device '{}'", info.name);

        let window_extent = match &window {
            Some(window) => {
                Some(wait_for_usable_size(window.as_ref()).ok_or(RenderError::WindowClosed)?)
            }
            None => None,
        };

        let compiler = ShaderCompiler::new(&settings, info.clip_y_down)?;
        let scheduler = FrameScheduler::new(&mut device, &settings, window_extent)?;
        let frames = scheduler.frames_in_flight();
        let mut uploader = Uploader::new(&mut device)?;

        let mut geometry = GeometryArena::new(&mut device)?;
        let default_mesh =
            geometry.load(&mut device, &mut uploader, &Arc::new(Mesh::default_triangle()))?;

        let mut textures = TextureRegistry::new(settings.max_textures);
        textures.create_defaults(&mut device, &mut uploader)?;

        let shadow_maps = ShadowMaps::new(
            &mut device,
            &mut uploader,
            settings.shadow_map_resolution,
            settings.depth_format,
            settings.max_shadow_maps,
        )?;

        let shadow_pass = ShadowPass::new(
            &mut device,
            &compiler,
            settings.depth_format,
            settings.shadow_map_resolution,
            frames,
        )?;
        let main_pass = MainPass::new(&mut device, &compiler, &settings, frames)?;
        let tone_map = ToneMapPass::new(
            &mut device,
            &compiler,
            settings.output_format,
            settings.tone_mapping,
            frames,
        )?;

        let fallback_image = textures
            .get(ImageId(DefaultTexture::Occlusion.index()))
            .map(|loaded| loaded.image)
            .ok_or(RenderError::NotInitialized)?;
        let fallback_sampler = textures
            .sampler_handle(DEFAULT_SAMPLER_KEY)
            .ok_or(RenderError::NotInitialized)?;
        let ui = UiCompositor::new(
            &mut device,
            &compiler,
            &settings,
            (fallback_image, fallback_sampler),
            frames,
        )?;

        let targets = RenderTargets::new(
            &mut device,
            scheduler.output_extent(),
            settings.color_format,
            settings.depth_format,
        )?;
        let particles = ParticleSubsystem::new(&mut device, settings.max_particles, frames)?;

        info!(
            "Renderer ready: {}x{}, {frames} frame(s) in flight",
            targets.extent.width, targets.extent.height
        );

        Ok(Self {
            materials: MaterialRegistry::new(settings.max_materials),
            objects: ObjectTable::new(settings.max_objects),
            lights: LightSets::new(),
            device,
            info,
            settings,
            world,
            window,
            scheduler,
            uploader,
            geometry,
            default_mesh,
            textures,
            shadow_maps,
            shadow_pass,
            main_pass,
            tone_map,
            ui,
            targets,
            particles,
            main_camera: None,
            compiler,
        })
    }

    // ========================================================================
    // Frame
    // ========================================================================

    /// Renders one frame. Does nothing while the window is closed.
    pub fn update(&mut self, _dt: f64) -> Result<()> {
        if self.window.as_ref().is_some_and(|w| !w.is_open()) {
            return Ok(());
        }

        let frame = match self.scheduler.begin_frame(&mut self.device)? {
            FrameStart::Ready(frame) => frame,
            FrameStart::OutOfDate => return self.resize(),
        };
        self.shadow_maps.release_retired(
            &mut self.device,
            frame.frame_index,
            self.scheduler.frames_in_flight(),
        )?;

        let bindings = self.shadow_maps.bindings(&self.lights);
        let draws = self.write_frame_buffers(frame.slot, &bindings)?;
        self.record(&frame, &bindings, &draws)?;

        match self.scheduler.end_frame(&mut self.device, frame)? {
            FrameEnd::OutOfDate => self.resize(),
            FrameEnd::Presented | FrameEnd::Offscreen => Ok(()),
        }
    }

    fn write_frame_buffers(
        &mut self,
        slot: usize,
        bindings: &ShadowBindings,
    ) -> Result<Vec<ObjectDraw>> {
        let buffers = self.scheduler.slot(slot).buffers;
        let world = Arc::clone(&self.world);

        let camera = self.camera_frustum();
        if let Some((frustum, position)) = &camera {
            let uniforms = CameraUniforms::new(frustum.view, frustum.projection, *position);
            self.device
                .write_buffer(buffers.camera, 0, bytemuck::bytes_of(&uniforms))?;
        }

        let mut draws = Vec::with_capacity(self.objects.len());
        for (entity, object) in self.objects.sorted() {
            let model = world.transform(entity).unwrap_or_default().matrix();
            let record = GpuObject::new(model, self.materials.shader_index(object.material));
            self.device.write_buffer(
                buffers.objects,
                u64::from(object.slot) * GpuObject::SIZE,
                bytemuck::bytes_of(&record),
            )?;
            let range = self
                .geometry
                .range(object.mesh)
                .or_else(|| self.geometry.range(self.default_mesh))
                .ok_or(RenderError::UnknownResource {
                    kind: "mesh",
                    index: object.mesh.0,
                })?;
            draws.push(ObjectDraw::new(object.slot, range));
        }

        if !self.materials.is_empty() {
            self.device
                .write_buffer(buffers.materials, 0, self.materials.as_bytes())?;
        }

        let lights = self.lights.build_buffer(
            world.as_ref(),
            self.settings.max_lights,
            bindings.directional.len() as u32,
            |e| bindings.index_of(e),
        );
        self.device.write_buffer(buffers.lights, 0, &lights)?;

        if let Some((frustum, _)) = &camera {
            let directional: Vec<Vec3> = bindings
                .directional
                .iter()
                .map(|(e, _)| world.transform(*e).unwrap_or_default().forward())
                .collect();
            let spots: Vec<SpotShadowInput> = bindings
                .spot
                .iter()
                .map(|(e, _)| {
                    let transform = world.transform(*e).unwrap_or_default();
                    SpotShadowInput {
                        position: transform.position,
                        direction: transform.forward(),
                        outer_cutoff: world.light(*e).map_or(0.5, |l| l.outer_cutoff),
                    }
                })
                .collect();
            let set = compute_shadows(frustum, &directional, &spots, self.info.clip_y_down);
            let (matrices, cascades) = shadow_buffer_bytes(&set);
            self.device
                .write_buffer(buffers.shadow_matrices, 0, &matrices)?;
            self.device.write_buffer(buffers.cascades, 0, &cascades)?;
        }

        Ok(draws)
    }

    /// View and projection of the main camera, if it still has a Camera.
    fn camera_frustum(&self) -> Option<(CameraFrustum, Vec3)> {
        let entity = self.main_camera?;
        let camera = self.world.camera(entity)?;
        let transform = self.world.transform(entity).unwrap_or_default();
        let view = transform.matrix().inverse();
        let mut projection = Mat4::perspective_rh(
            camera.fov_y,
            self.targets.extent.aspect(),
            camera.near,
            camera.far,
        );
        if self.info.clip_y_down {
            projection.y_axis.y *= -1.0;
        }
        Some((
            CameraFrustum {
                view,
                projection,
                near: camera.near,
                far: camera.far,
            },
            transform.position,
        ))
    }

    fn record(
        &mut self,
        frame: &ActiveFrame,
        bindings: &ShadowBindings,
        draws: &[ObjectDraw],
    ) -> Result<()> {
        let buffers = self.scheduler.slot(frame.slot).buffers;
        let ctx = FrameContext {
            slot: frame.slot,
            buffers: &buffers,
            geometry: &self.geometry,
            textures: &self.textures,
            draws,
            shadows: bindings,
            dummy_shadow_map: self.shadow_maps.dummy(),
            targets: &self.targets,
            output: frame.output,
            output_extent: frame.extent,
        };

        let slot = self.scheduler.slot_mut(frame.slot);
        let mut dirty = slot.dirty;
        let nodes: [&mut dyn RenderNode; 4] = [
            &mut self.shadow_pass,
            &mut self.main_pass,
            &mut self.tone_map,
            &mut self.ui,
        ];
        for node in nodes {
            node.prepare(&mut self.device, &ctx, &mut dirty)?;
        }
        slot.dirty = dirty;

        let recorder = &mut slot.recorder;
        self.particles.record(&mut self.device, recorder, frame.slot)?;
        let nodes: [&dyn RenderNode; 4] =
            [&self.shadow_pass, &self.main_pass, &self.tone_map, &self.ui];
        for node in nodes {
            recorder.marker(node.name());
            node.run(&ctx, recorder);
        }

        let final_layout = if frame.image_index.is_some() {
            ImageLayout::PresentSrc
        } else {
            ImageLayout::TransferSrc
        };
        recorder.barrier(ImageBarrier::whole(
            frame.output,
            ImageLayout::ColorAttachment,
            final_layout,
        ));
        Ok(())
    }

    /// Rebuilds the output and the render targets at the window's current
    /// size, polling until the size has a non-zero area.
    pub fn resize(&mut self) -> Result<()> {
        let extent = match &self.window {
            Some(window) => match wait_for_usable_size(window.as_ref()) {
                Some(extent) => extent,
                None => {
                    debug!("Window closed while waiting for a usable size");
                    return Ok(());
                }
            },
            None => self.scheduler.output_extent(),
        };
        self.scheduler.recreate_output(&mut self.device, extent)?;
        self.targets.recreate(&mut self.device, extent)?;
        self.scheduler.mark_all(DirtyFlags::TONE_MAP_BINDINGS);
        debug!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    pub fn load_mesh(&mut self, mesh: &Arc<Mesh>) -> Result<MeshId> {
        self.geometry.load(&mut self.device, &mut self.uploader, mesh)
    }

    pub fn load_image(&mut self, image: &Arc<Image>) -> Result<ImageId> {
        self.textures
            .load_image(&mut self.device, &mut self.uploader, image, true)
    }

    pub fn load_font(&mut self, font: &Arc<Font>) -> Result<FontId> {
        let (id, added) =
            self.ui
                .load_font(&mut self.device, &mut self.uploader, &mut self.textures, font)?;
        if added {
            self.scheduler.mark_all(DirtyFlags::UI_TEXT_BINDINGS);
        }
        Ok(id)
    }

    /// Resolves a material's textures and returns its deduplicated index.
    pub fn load_material(&mut self, material: &Material) -> Result<u32> {
        let slots = [
            (&material.diffuse, DefaultTexture::Diffuse),
            (&material.normal, DefaultTexture::Normal),
            (&material.metalness, DefaultTexture::Metalness),
            (&material.roughness, DefaultTexture::Roughness),
            (&material.occlusion, DefaultTexture::Occlusion),
            (&material.emissive, DefaultTexture::Emissive),
        ];
        let mut indices = [0u32; 6];
        let mut inserted = false;
        for (index, (texture, fallback)) in indices.iter_mut().zip(slots) {
            let insert =
                self.textures
                    .resolve(&mut self.device, &mut self.uploader, texture, fallback)?;
            inserted |= insert.inserted;
            *index = insert.index;
        }
        if inserted {
            self.scheduler.mark_all(DirtyFlags::MAIN_BINDINGS);
        }
        let [diffuse, normal, metalness, roughness, occlusion, emissive] = indices;
        self.materials.add(GpuMaterial {
            diffuse,
            normal,
            metalness,
            roughness,
            occlusion,
            emissive,
            emissive_factor: material.emissive_factor,
            alpha_cutoff: material.alpha_cutoff,
        })
    }

    // ========================================================================
    // UI
    // ========================================================================

    pub fn draw_ui_text(
        &mut self,
        font: FontId,
        text: &str,
        position: Vec2,
        color: Vec4,
    ) -> Result<()> {
        self.ui.queue_text(font, text, position, color)
    }

    pub fn draw_ui_line(&mut self, a: Vec2, b: Vec2, color: Vec4) {
        self.ui.queue_line(a, b, color);
    }

    pub fn draw_ui_rectangle(&mut self, position: Vec2, size: Vec2, color: Vec4) {
        self.ui.queue_rectangle(position, size, color);
    }

    pub fn draw_ui_image(
        &mut self,
        image: ImageId,
        filter: SamplerFilter,
        position: Vec2,
        rotation: f32,
        scale: Vec2,
        color: Vec4,
    ) -> Result<()> {
        let grew = self.ui.queue_image(
            &mut self.device,
            &mut self.textures,
            image,
            filter,
            position,
            rotation,
            scale,
            color,
        )?;
        if grew {
            self.scheduler.mark_all(DirtyFlags::UI_IMAGE_BINDINGS);
        }
        Ok(())
    }

    /// Queues particles for the frame that records next.
    pub fn emit_particles(&mut self, emitter: &ParticleEmitter) -> Result<u32> {
        Ok(self.particles.emit(emitter))
    }

    // ========================================================================
    // Scene callbacks
    // ========================================================================

    pub fn on_component_added(&mut self, entity: Entity, kind: ComponentKind) -> Result<()> {
        match kind {
            ComponentKind::Renderable => {
                let Some(renderable) = self.world.renderable(entity) else {
                    warn!("Entity {entity} reported a Renderable it does not have");
                    return Ok(());
                };
                let mesh = match &renderable.mesh {
                    Some(mesh) if !mesh.is_empty() => self.load_mesh(mesh)?,
                    _ => self.default_mesh,
                };
                let material = self.load_material(&renderable.material)?;
                let object = self.objects.insert(entity, mesh, material)?;
                debug!("Entity {entity} renders from object slot {}", object.slot);
            }
            ComponentKind::Camera => {
                if self.main_camera.is_none() {
                    self.main_camera = Some(entity);
                    debug!("Entity {entity} is the main camera");
                }
            }
            ComponentKind::Light => {
                let Some(light) = self.world.light(entity) else {
                    warn!("Entity {entity} reported a Light it does not have");
                    return Ok(());
                };
                self.lights.insert(entity, light.kind);
                let frames_begun = self.scheduler.frames_begun();
                if light.casts_shadow() {
                    self.shadow_maps.ensure(
                        &mut self.device,
                        &mut self.uploader,
                        entity,
                        light.kind,
                        frames_begun,
                    )?;
                } else {
                    self.shadow_maps.retire(entity, frames_begun);
                }
                self.scheduler.mark_all(DirtyFlags::MAIN_BINDINGS);
            }
            ComponentKind::Transform => {}
        }
        Ok(())
    }

    pub fn on_component_removed(&mut self, entity: Entity, kind: ComponentKind) -> Result<()> {
        match kind {
            ComponentKind::Renderable => {
                self.objects.remove(entity);
            }
            ComponentKind::Camera => {
                if self.main_camera == Some(entity) {
                    self.main_camera = None;
                }
            }
            ComponentKind::Light => {
                if self.lights.remove(entity).is_some() {
                    self.shadow_maps
                        .retire(entity, self.scheduler.frames_begun());
                    self.scheduler.mark_all(DirtyFlags::MAIN_BINDINGS);
                }
            }
            ComponentKind::Transform => {}
        }
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Waits for the queue, releases everything in reverse dependency order
    /// and hands the device back.
    pub fn destroy(self) -> Result<D> {
        let Self {
            mut device,
            mut scheduler,
            uploader,
            geometry,
            textures,
            shadow_maps,
            shadow_pass,
            main_pass,
            tone_map,
            ui,
            targets,
            particles,
            ..
        } = self;

        device.wait_idle()?;
        scheduler.destroy_slots(&mut device)?;
        particles.destroy(&mut device)?;
        ui.destroy(&mut device)?;
        tone_map.destroy(&mut device)?;
        main_pass.destroy(&mut device)?;
        shadow_pass.destroy(&mut device)?;
        targets.destroy(&mut device)?;
        shadow_maps.destroy(&mut device)?;
        textures.destroy(&mut device)?;
        geometry.destroy(&mut device)?;
        uploader.destroy(&mut device)?;
        scheduler.destroy(&mut device)?;
        info!("Renderer destroyed");
        Ok(device)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    #[must_use]
    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.scheduler.frames_in_flight()
    }

    #[must_use]
    pub fn draw_extent(&self) -> Extent {
        self.targets.extent
    }

    #[must_use]
    pub fn targets(&self) -> &RenderTargets {
        &self.targets
    }

    #[must_use]
    pub fn geometry(&self) -> &GeometryArena {
        &self.geometry
    }

    #[must_use]
    pub fn default_mesh(&self) -> MeshId {
        self.default_mesh
    }

    #[must_use]
    pub fn textures(&self) -> &TextureRegistry {
        &self.textures
    }

    #[must_use]
    pub fn materials(&self) -> &MaterialRegistry {
        &self.materials
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    #[must_use]
    pub fn lights(&self) -> &LightSets {
        &self.lights
    }

    #[must_use]
    pub fn shadow_maps(&self) -> &ShadowMaps {
        &self.shadow_maps
    }

    #[must_use]
    pub fn ui(&self) -> &UiCompositor {
        &self.ui
    }

    #[must_use]
    pub fn particles(&self) -> &ParticleSubsystem {
        &self.particles
    }

    #[must_use]
    pub fn main_camera(&self) -> Option<Entity> {
        self.main_camera
    }

    #[must_use]
    pub fn tone_mapping(&self) -> &ToneMapPass {
        &self.tone_map
    }

    pub fn tone_mapping_mut(&mut self) -> &mut ToneMapPass {
        &mut self.tone_map
    }

    #[must_use]
    pub fn shader_compiler(&self) -> &Arc<ShaderCompiler> {
        &self.compiler
    }
}

/// Polls the window until it reports a non-zero size. `None` once it closes.
fn wait_for_usable_size(window: &dyn WindowProvider) -> Option<Extent> {
    loop {
        if !window.is_open() {
            return None;
        }
        let size = window.size();
        if !size.is_zero_area() {
            return Some(size);
        }
        window.poll_events();
    }
}
