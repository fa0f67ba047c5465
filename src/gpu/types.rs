//! Device object handles and descriptors.
//!
//! Every device object is addressed through a slotmap key (index plus
//! generation), so a handle used after its object was destroyed is detected
//! instead of aliasing a newer object.

use slotmap::new_key_type;
use smallvec::SmallVec;

new_key_type! {
    pub struct BufferHandle;
    pub struct ImageHandle;
    pub struct SamplerHandle;
    pub struct BindingLayoutHandle;
    pub struct BindingTableHandle;
    pub struct PipelineHandle;
    pub struct ShaderModuleHandle;
    pub struct FenceHandle;
    pub struct SemaphoreHandle;
    pub struct OutputChainHandle;
}

// ============================================================================
// Buffers
// ============================================================================

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
    /// Host-visible buffers accept [`GpuDevice::write_buffer`](super::GpuDevice::write_buffer).
    pub host_visible: bool,
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    /// Array layers. Shadow maps use one layer per cascade.
    pub layers: u32,
    pub mip_levels: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl ImageDesc<'_> {
    #[must_use]
    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[must_use]
    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Tracked layout of one image subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents are discarded. Valid as the source of any transition.
    Undefined,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub from: ImageLayout,
    pub to: ImageLayout,
    /// Scoped to the touched region rather than a whole-queue dependency.
    pub by_region: bool,
}

impl ImageBarrier {
    /// Transition of the first mip of `layer_count` layers.
    #[must_use]
    pub fn layers(
        image: ImageHandle,
        layer_count: u32,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Self {
        Self {
            image,
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count,
            from,
            to,
            by_region: true,
        }
    }

    /// Transition of a single-layer, single-mip image.
    #[must_use]
    pub fn whole(image: ImageHandle, from: ImageLayout, to: ImageLayout) -> Self {
        Self::layers(image, 1, from, to)
    }

    #[must_use]
    pub fn mips(mut self, base_mip: u32, mip_count: u32) -> Self {
        self.base_mip = base_mip;
        self.mip_count = mip_count;
        self
    }
}

// ============================================================================
// Samplers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::MipmapFilterMode,
    pub address_mode: [wgpu::AddressMode; 3],
    /// 1 disables anisotropic filtering.
    pub anisotropy: u16,
    pub border_color: Option<wgpu::SamplerBorderColor>,
    /// Depth comparison for shadow sampling.
    pub compare: Option<wgpu::CompareFunction>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Linear,
            address_mode: [wgpu::AddressMode::Repeat; 3],
            anisotropy: 1,
            border_color: None,
            compare: None,
        }
    }
}

impl SamplerDesc {
    /// Cache key: samplers with equal keys are shared.
    #[must_use]
    pub fn sampler_key(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{}|{:?}|{:?}",
            self.mag_filter,
            self.min_filter,
            self.mipmap_filter,
            self.address_mode[0],
            self.address_mode[1],
            self.address_mode[2],
            self.anisotropy,
            self.border_color,
            self.compare,
        )
    }
}

// ============================================================================
// Binding tables
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    Storage {
        read_only: bool,
    },
    /// `count > 1` declares a partially bound array.
    Texture {
        dimension: wgpu::TextureViewDimension,
        sample_type: wgpu::TextureSampleType,
        count: u32,
    },
    Sampler {
        comparison: bool,
        count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub visibility: wgpu::ShaderStages,
    pub kind: BindingKind,
}

#[derive(Debug, Clone)]
pub struct BindingLayoutDesc<'a> {
    pub label: &'a str,
    pub entries: &'a [BindingLayoutEntry],
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingResource {
    Buffer(BufferHandle),
    /// Array elements past the populated count are left unbound.
    Textures(SmallVec<[ImageHandle; 4]>),
    Samplers(SmallVec<[SamplerHandle; 4]>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingWrite {
    pub binding: u32,
    pub resource: BindingResource,
}

// ============================================================================
// Pipelines
// ============================================================================

/// Interleaved vertex layout of the geometry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexLayout {
    /// No vertex buffers; the shader generates positions.
    None,
    /// [`Vertex`](crate::assets::Vertex) records.
    Mesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTargetDesc {
    pub format: wgpu::TextureFormat,
    pub blend: Option<wgpu::BlendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthDesc {
    pub format: wgpu::TextureFormat,
    pub write: bool,
    pub compare: wgpu::CompareFunction,
    /// Clamp fragments outside the depth range instead of clipping them.
    pub clamp: bool,
    pub bias: wgpu::DepthBiasState,
}

#[derive(Debug, Clone)]
pub struct PipelineDesc<'a> {
    pub label: &'a str,
    pub shader: ShaderModuleHandle,
    pub vertex_entry: &'a str,
    pub fragment_entry: Option<&'a str>,
    pub vertex_layout: VertexLayout,
    pub binding_layouts: &'a [BindingLayoutHandle],
    /// Reserves the trailing group for [`PushConstants`](super::PushConstants).
    pub uses_constants: bool,
    pub color_targets: &'a [ColorTargetDesc],
    pub depth: Option<DepthDesc>,
    pub topology: wgpu::PrimitiveTopology,
    pub cull_mode: Option<wgpu::Face>,
}

// ============================================================================
// Rendering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<V> {
    Clear(V),
    Load,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub image: ImageHandle,
    pub layer: u32,
    pub load: LoadOp<wgpu::Color>,
    pub store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub image: ImageHandle,
    pub layer: u32,
    pub load: LoadOp<f32>,
    pub store: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingInfo {
    pub label: &'static str,
    pub color: SmallVec<[ColorAttachment; 2]>,
    pub depth: Option<DepthAttachment>,
    pub extent: Extent,
}

// ============================================================================
// Presentation
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutputChainDesc {
    pub extent: Extent,
    pub format: wgpu::TextureFormat,
    pub vsync: bool,
}

/// Images and parameters of a created output chain.
#[derive(Debug, Clone)]
pub struct OutputChain {
    pub handle: OutputChainHandle,
    pub images: Vec<ImageHandle>,
    pub format: wgpu::TextureFormat,
    pub extent: Extent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Usable this frame, but the chain should be recreated afterwards.
    Suboptimal(u32),
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    OutOfDate,
}

/// Static facts about the device the frame core adapts to.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Clip space Y points down; projections are flipped to match.
    pub clip_y_down: bool,
    pub supports_depth_clamp: bool,
}
