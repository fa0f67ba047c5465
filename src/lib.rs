#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod assets;
pub mod errors;
pub mod frame;
pub mod gpu;
pub mod module;
pub mod particles;
pub mod passes;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod settings;
pub mod shadow;
pub mod window;

pub use assets::{Font, Glyph, Image, ImageFormat, Material, Mesh, SamplerFilter, TextureRef, Vertex};
pub use errors::{DeviceErrorCode, RenderError, Result};
pub use frame::{DirtyFlags, FrameScheduler};
pub use gpu::{GpuDevice, HeadlessDevice};
pub use module::{GraphicsModule, RenderModule, create_module};
pub use particles::ParticleEmitter;
pub use passes::{FontId, UiPrimitiveKind};
pub use renderer::Renderer;
pub use resources::{ImageId, MeshId};
pub use scene::{Camera, ComponentKind, Entity, Light, LightKind, Renderable, SceneStore, Transform, World};
pub use settings::{RendererSettings, SHADOW_CASCADE_COUNT, ToneMapMode, ToneMapSettings};
pub use window::{VirtualWindow, WindowProvider};

#[cfg(feature = "wgpu_backend")]
pub use gpu::WgpuDevice;
