//! Module Façade
//!
//! The host runtime drives the renderer through [`GraphicsModule`]: a fixed
//! capability set of lifecycle, loading, UI and scene callbacks. Instances are
//! built by [`create_module`]; nothing inside the crate dispatches through the
//! trait.
//!
//! Fatal errors are logged here, at the boundary, and handed back to the host,
//! which is expected to abort.

use std::sync::Arc;

use glam::{Vec2, Vec4};
use log::error;

use crate::assets::{Font, Image, Mesh, SamplerFilter};
use crate::errors::{RenderError, Result};
use crate::gpu::GpuDevice;
use crate::particles::ParticleEmitter;
use crate::passes::FontId;
use crate::renderer::Renderer;
use crate::resources::{ImageId, MeshId};
use crate::scene::{ComponentKind, Entity, World};
use crate::settings::RendererSettings;
use crate::window::WindowProvider;

pub trait GraphicsModule {
    fn init(&mut self) -> Result<()>;
    /// Advances one frame; a no-op while the window is closed.
    fn update(&mut self, dt: f64) -> Result<()>;
    fn destroy(&mut self) -> Result<()>;

    fn load_mesh(&mut self, mesh: &Arc<Mesh>) -> Result<MeshId>;
    fn load_image(&mut self, image: &Arc<Image>) -> Result<ImageId>;
    fn load_font(&mut self, font: &Arc<Font>) -> Result<FontId>;

    fn draw_ui_text(&mut self, font: FontId, text: &str, position: Vec2, color: Vec4) -> Result<()>;
    fn draw_ui_line(&mut self, a: Vec2, b: Vec2, color: Vec4) -> Result<()>;
    fn draw_ui_rectangle(&mut self, position: Vec2, size: Vec2, color: Vec4) -> Result<()>;
    fn draw_ui_image(
        &mut self,
        image: ImageId,
        filter: SamplerFilter,
        position: Vec2,
        rotation: f32,
        scale: Vec2,
        color: Vec4,
    ) -> Result<()>;
    fn emit_particles(&mut self, emitter: &ParticleEmitter) -> Result<u32>;

    fn on_component_added(&mut self, entity: Entity, kind: ComponentKind) -> Result<()>;
    fn on_component_removed(&mut self, entity: Entity, kind: ComponentKind) -> Result<()>;
}

enum ModuleState<D: GpuDevice> {
    Created(D),
    Running(Box<Renderer<D>>),
    Destroyed(D),
    /// A fatal error consumed the device.
    Failed,
}

/// [`GraphicsModule`] over any [`GpuDevice`].
pub struct RenderModule<D: GpuDevice> {
    state: ModuleState<D>,
    settings: RendererSettings,
    world: Arc<dyn World>,
    window: Option<Arc<dyn WindowProvider>>,
}

/// Logs a fatal error before it crosses the module boundary.
fn report<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("{operation} failed: {e}");
    }
    result
}

impl<D: GpuDevice> RenderModule<D> {
    #[must_use]
    pub fn new(
        device: D,
        settings: RendererSettings,
        world: Arc<dyn World>,
        window: Option<Arc<dyn WindowProvider>>,
    ) -> Self {
        Self {
            state: ModuleState::Created(device),
            settings,
            world,
            window,
        }
    }

    /// The running renderer, if `init` succeeded and `destroy` was not called.
    #[must_use]
    pub fn renderer(&self) -> Option<&Renderer<D>> {
        match &self.state {
            ModuleState::Running(renderer) => Some(&**renderer),
            _ => None,
        }
    }

    pub fn renderer_mut(&mut self) -> Option<&mut Renderer<D>> {
        match &mut self.state {
            ModuleState::Running(renderer) => Some(&mut **renderer),
            _ => None,
        }
    }

    /// The device, whichever state the module is in.
    #[must_use]
    pub fn device(&self) -> Option<&D> {
        match &self.state {
            ModuleState::Created(device) | ModuleState::Destroyed(device) => Some(device),
            ModuleState::Running(renderer) => Some(renderer.device()),
            ModuleState::Failed => None,
        }
    }

    fn running(&mut self) -> Result<&mut Renderer<D>> {
        self.renderer_mut().ok_or(RenderError::NotInitialized)
    }
}

impl<D: GpuDevice> GraphicsModule for RenderModule<D> {
    fn init(&mut self) -> Result<()> {
        let device = match std::mem::replace(&mut self.state, ModuleState::Failed) {
            ModuleState::Created(device) => device,
            other => {
                self.state = other;
                return report("init", Err(RenderError::NotInitialized));
            }
        };
        let renderer = Renderer::new(
            device,
            self.settings.clone(),
            Arc::clone(&self.world),
            self.window.clone(),
        );
        let renderer = report("init", renderer)?;
        self.state = ModuleState::Running(Box::new(renderer));
        Ok(())
    }

    fn update(&mut self, dt: f64) -> Result<()> {
        let result = self.running().and_then(|r| r.update(dt));
        report("update", result)
    }

    fn destroy(&mut self) -> Result<()> {
        let renderer = match std::mem::replace(&mut self.state, ModuleState::Failed) {
            ModuleState::Running(renderer) => renderer,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let device = report("destroy", renderer.destroy())?;
        self.state = ModuleState::Destroyed(device);
        Ok(())
    }

    fn load_mesh(&mut self, mesh: &Arc<Mesh>) -> Result<MeshId> {
        let result = self.running().and_then(|r| r.load_mesh(mesh));
        report("load mesh", result)
    }

    fn load_image(&mut self, image: &Arc<Image>) -> Result<ImageId> {
        let result = self.running().and_then(|r| r.load_image(image));
        report("load image", result)
    }

    fn load_font(&mut self, font: &Arc<Font>) -> Result<FontId> {
        let result = self.running().and_then(|r| r.load_font(font));
        report("load font", result)
    }

    fn draw_ui_text(&mut self, font: FontId, text: &str, position: Vec2, color: Vec4) -> Result<()> {
        self.running()?.draw_ui_text(font, text, position, color)
    }

    fn draw_ui_line(&mut self, a: Vec2, b: Vec2, color: Vec4) -> Result<()> {
        self.running()?.draw_ui_line(a, b, color);
        Ok(())
    }

    fn draw_ui_rectangle(&mut self, position: Vec2, size: Vec2, color: Vec4) -> Result<()> {
        self.running()?.draw_ui_rectangle(position, size, color);
        Ok(())
    }

    fn draw_ui_image(
        &mut self,
        image: ImageId,
        filter: SamplerFilter,
        position: Vec2,
        rotation: f32,
        scale: Vec2,
        color: Vec4,
    ) -> Result<()> {
        self.running()?
            .draw_ui_image(image, filter, position, rotation, scale, color)
    }

    fn emit_particles(&mut self, emitter: &ParticleEmitter) -> Result<u32> {
        self.running()?.emit_particles(emitter)
    }

    fn on_component_added(&mut self, entity: Entity, kind: ComponentKind) -> Result<()> {
        let result = self
            .running()
            .and_then(|r| r.on_component_added(entity, kind));
        report("component added", result)
    }

    fn on_component_removed(&mut self, entity: Entity, kind: ComponentKind) -> Result<()> {
        let result = self
            .running()
            .and_then(|r| r.on_component_removed(entity, kind));
        report("component removed", result)
    }
}

/// Builds a module over `device`. GPU resources are allocated by `init`.
#[must_use]
pub fn create_module<D: GpuDevice + 'static>(
    device: D,
    settings: RendererSettings,
    world: Arc<dyn World>,
    window: Option<Arc<dyn WindowProvider>>,
) -> Box<dyn GraphicsModule> {
    Box::new(RenderModule::new(device, settings, world, window))
}
