//! Renderer Settings
//!
//! [`RendererSettings`] gathers every tunable of the frame core: target
//! formats, the headless draw extent, fixed table capacities and tone mapping.
//! Frames in flight are *not* configured here; they are derived at init time
//! from whether a window is attached (2) or not (1).
//!
//! ```rust,ignore
//! use ember::settings::{RendererSettings, ToneMapMode, ToneMapSettings};
//!
//! let settings = RendererSettings {
//!     shadow_map_resolution: 1024,
//!     tone_mapping: ToneMapSettings { exposure: 1.5, mode: ToneMapMode::Reinhard },
//!     ..Default::default()
//! };
//! ```

/// Number of cascades per directional light. Shared by the cascade computer
/// and the shadow pass (one depth layer per cascade).
pub const SHADOW_CASCADE_COUNT: usize = 4;

/// Color format of the HDR scene target.
pub const HDR_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

// ---------------------------------------------------------------------------
// Tone mapping
// ---------------------------------------------------------------------------

/// Curve applied by the tone-mapping pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToneMapMode {
    Linear,
    Reinhard,
    #[default]
    AcesFilmic,
}

impl ToneMapMode {
    /// Integer id consumed by the tone-mapping shader.
    #[must_use]
    pub fn shader_id(self) -> u32 {
        match self {
            Self::Linear => 0,
            Self::Reinhard => 1,
            Self::AcesFilmic => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMapSettings {
    pub exposure: f32,
    pub mode: ToneMapMode,
}

impl Default for ToneMapSettings {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            mode: ToneMapMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RendererSettings {
    // === Targets ===
    /// Extent of the offscreen draw target when no window is attached.
    pub headless_extent: (u32, u32),

    /// Format of the HDR color target rendered by the main pass.
    pub color_format: wgpu::TextureFormat,

    pub depth_format: wgpu::TextureFormat,

    /// Format of the output image (swapchain or headless draw image).
    pub output_format: wgpu::TextureFormat,

    /// Edge length of every shadow-map layer.
    pub shadow_map_resolution: u32,

    // === Capacities ===
    /// Live object bound; sizes the per-frame object buffer.
    pub max_objects: u32,
    pub max_materials: u32,
    pub max_lights: u32,
    /// Length of the bindless texture array.
    pub max_textures: u32,
    /// Length of the shadow-map array bound to the main pass.
    pub max_shadow_maps: u32,
    pub max_fonts: u32,
    pub max_ui_glyphs: u32,
    pub max_ui_textures: u32,
    pub max_particles: u32,

    // === Presentation ===
    pub vsync: bool,
    pub clear_color: wgpu::Color,
    pub tone_mapping: ToneMapSettings,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            headless_extent: (1280, 720),
            color_format: HDR_TEXTURE_FORMAT,
            depth_format: wgpu::TextureFormat::Depth32Float,
            output_format: wgpu::TextureFormat::Bgra8UnormSrgb,
            shadow_map_resolution: 2048,
            max_objects: 4096,
            max_materials: 1024,
            max_lights: 256,
            max_textures: 1024,
            max_shadow_maps: 16,
            max_fonts: 16,
            max_ui_glyphs: 8192,
            max_ui_textures: 64,
            max_particles: 100_000,
            vsync: true,
            clear_color: wgpu::Color {
                r: 0.0,
                g: 0.0,
                b: 0.0,
                a: 1.0,
            },
            tone_mapping: ToneMapSettings::default(),
        }
    }
}

impl RendererSettings {
    /// Frames in flight for the given presentation mode.
    #[inline]
    #[must_use]
    pub fn frames_in_flight(windowed: bool) -> usize {
        if windowed { 2 } else { 1 }
    }
}
