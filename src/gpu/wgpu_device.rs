//! wgpu backend.
//!
//! [`WgpuDevice`] runs the frame core on a real GPU. wgpu tracks resource
//! usage itself, so several parts of the device seam reduce to bookkeeping:
//!
//! - image barriers are accepted and dropped
//! - semaphores are ordering tokens; the single queue already orders work
//! - fences are submission indices plus a completion flag
//!
//! Binding tables become bind groups lazily, at the first submission after a
//! write. The constant block of each draw lives in a per-submission uniform
//! ring, bound with a dynamic offset in the pipeline's trailing group at
//! binding [`CONSTANTS_BINDING`]. Uploads into images are replayed from a
//! host mirror of the staging buffer through `write_texture`, which has no
//! row alignment requirement.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use super::command::{Command, CommandList, PushConstants};
use super::device::{GpuDevice, ShaderSource, SubmitInfo};
use super::types::{
    AcquireOutcome, BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle,
    BindingResource, BindingTableHandle, BindingWrite, BufferDesc, BufferHandle, DeviceInfo,
    FenceHandle, ImageDesc, ImageHandle, LoadOp, OutputChain, OutputChainDesc,
    OutputChainHandle, PipelineDesc, PipelineHandle, PresentOutcome, RenderingInfo, SamplerDesc,
    SamplerHandle, SemaphoreHandle, ShaderModuleHandle, VertexLayout,
};
use crate::assets::Vertex;
use crate::errors::{DeviceErrorCode, RenderError, Result};

/// Binding of the constant block inside a pipeline's trailing group.
pub const CONSTANTS_BINDING: u32 = 15;

/// Dynamic uniform offsets must be 256-byte aligned.
const CONSTANTS_STRIDE: u64 = 256;

const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x2,
    3 => Float32x3,
    4 => Float32x4,
];

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    /// Host copy of a host-visible buffer; the source of image uploads.
    mirror: Option<Vec<u8>>,
}

enum ImageBacking {
    Texture(wgpu::Texture),
    /// Whatever texture the chain acquired last.
    Surface(OutputChainHandle),
}

struct WgpuImage {
    label: String,
    backing: ImageBacking,
    format: wgpu::TextureFormat,
}

struct WgpuLayout {
    layout: wgpu::BindGroupLayout,
    entries: Vec<BindingLayoutEntry>,
}

struct WgpuTable {
    label: String,
    layout: BindingLayoutHandle,
    bindings: FxHashMap<u32, BindingResource>,
    /// Rebuilt on the next submission when `None`.
    group: Option<wgpu::BindGroup>,
}

struct WgpuPipeline {
    pipeline: wgpu::RenderPipeline,
    /// Group index of the constant block, if the pipeline reads one.
    constants_group: Option<u32>,
}

struct WgpuFence {
    signaled: bool,
    pending: Option<(wgpu::SubmissionIndex, Arc<AtomicBool>)>,
}

struct WgpuChain {
    images: Vec<ImageHandle>,
    next: u32,
    current: Option<wgpu::SurfaceTexture>,
}

struct ConstantRing {
    layout: wgpu::BindGroupLayout,
    buffer: wgpu::Buffer,
    group: wgpu::BindGroup,
    capacity: u64,
}

impl ConstantRing {
    fn new(device: &wgpu::Device, capacity: u64) -> Self {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Constants Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: CONSTANTS_BINDING,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(PushConstants::SIZE),
                },
                count: None,
            }],
        });
        let (buffer, group) = Self::allocate(device, &layout, capacity);
        Self {
            layout,
            buffer,
            group,
            capacity,
        }
    }

    fn allocate(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        capacity: u64,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Constants Ring"),
            size: capacity * CONSTANTS_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Constants Group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: CONSTANTS_BINDING,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(PushConstants::SIZE),
                }),
            }],
        });
        (buffer, group)
    }

    /// Writes every constant block of `commands` at consecutive ring slots.
    fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, commands: &CommandList) {
        let blocks: Vec<&PushConstants> = commands
            .iter()
            .filter_map(|c| match c {
                Command::SetConstants(constants) => Some(constants),
                _ => None,
            })
            .collect();
        if blocks.is_empty() {
            return;
        }
        let needed = blocks.len() as u64;
        if needed > self.capacity {
            let capacity = needed.next_power_of_two();
            (self.buffer, self.group) = Self::allocate(device, &self.layout, capacity);
            self.capacity = capacity;
            debug!("Constant ring grown to {capacity} blocks");
        }
        let mut bytes = vec![0u8; blocks.len() * CONSTANTS_STRIDE as usize];
        for (i, block) in blocks.iter().enumerate() {
            let start = i * CONSTANTS_STRIDE as usize;
            bytes[start..start + PushConstants::SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(*block));
        }
        queue.write_buffer(&self.buffer, 0, &bytes);
    }
}

struct MipBlitter {
    shader: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    pipelines: FxHashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl MipBlitter {
    fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mip Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/mip_blit.wgsl").into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Mip Blit Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Mip Blit Pipeline Layout"),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Mip Blit Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            shader,
            layout,
            pipeline_layout,
            sampler,
            pipelines: FxHashMap::default(),
        }
    }

    fn ensure_pipeline(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) {
        if self.pipelines.contains_key(&format) {
            return;
        }
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Mip Blit Pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        self.pipelines.insert(format, pipeline);
    }
}

/// One prepared mip downsample, in command order.
struct PreparedBlit {
    group: wgpu::BindGroup,
    target: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

/// Draw state that must be replayed at the start of every render pass.
#[derive(Default)]
struct EncodeState {
    pipeline: Option<PipelineHandle>,
    tables: FxHashMap<u32, BindingTableHandle>,
    constants_offset: Option<u32>,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
}

fn invalid(kind: &str) -> RenderError {
    RenderError::device(
        DeviceErrorCode::InvalidHandle,
        format!("{kind} handle is stale or unknown"),
    )
}

fn load_op<V: Copy>(op: LoadOp<V>) -> wgpu::LoadOp<V> {
    match op {
        LoadOp::Clear(value) => wgpu::LoadOp::Clear(value),
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::DontCare => wgpu::LoadOp::DontCare(wgpu::LoadOpDontCare::default()),
    }
}

fn store_op(store: bool) -> wgpu::StoreOp {
    if store {
        wgpu::StoreOp::Store
    } else {
        wgpu::StoreOp::Discard
    }
}

fn layout_entry(entry: &BindingLayoutEntry) -> wgpu::BindGroupLayoutEntry {
    let buffer = |ty| wgpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    let (ty, count) = match entry.kind {
        BindingKind::Uniform => (buffer(wgpu::BufferBindingType::Uniform), 1),
        BindingKind::Storage { read_only } => {
            (buffer(wgpu::BufferBindingType::Storage { read_only }), 1)
        }
        BindingKind::Texture {
            dimension,
            sample_type,
            count,
        } => (
            wgpu::BindingType::Texture {
                sample_type,
                view_dimension: dimension,
                multisampled: false,
            },
            count,
        ),
        BindingKind::Sampler { comparison, count } => (
            wgpu::BindingType::Sampler(if comparison {
                wgpu::SamplerBindingType::Comparison
            } else {
                wgpu::SamplerBindingType::Filtering
            }),
            count,
        ),
    };
    wgpu::BindGroupLayoutEntry {
        binding: entry.binding,
        visibility: entry.visibility,
        ty,
        count: if count > 1 { NonZeroU32::new(count) } else { None },
    }
}

/// Repeats the last element until `items` fills a binding array of `count`.
fn pad_to<T: Clone>(items: &mut Vec<T>, count: u32) {
    if let Some(last) = items.last().cloned() {
        items.resize(count as usize, last);
    }
}

pub struct WgpuDevice {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    surface: Option<wgpu::Surface<'static>>,
    depth_clamp: bool,

    buffers: SlotMap<BufferHandle, WgpuBuffer>,
    images: SlotMap<ImageHandle, WgpuImage>,
    samplers: SlotMap<SamplerHandle, wgpu::Sampler>,
    layouts: SlotMap<BindingLayoutHandle, WgpuLayout>,
    tables: SlotMap<BindingTableHandle, WgpuTable>,
    shaders: SlotMap<ShaderModuleHandle, wgpu::ShaderModule>,
    pipelines: SlotMap<PipelineHandle, WgpuPipeline>,
    fences: SlotMap<FenceHandle, WgpuFence>,
    semaphores: SlotMap<SemaphoreHandle, ()>,
    chains: SlotMap<OutputChainHandle, WgpuChain>,

    constants: ConstantRing,
    blitter: MipBlitter,
}

impl WgpuDevice {
    /// Opens a device without a presentation surface.
    pub fn headless() -> Result<Self> {
        pollster::block_on(Self::create(wgpu::Instance::default(), None))
    }

    /// Opens a device able to present into `window`.
    pub fn with_window<W>(window: W) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::AdapterRequestFailed(e.to_string()))?;
        pollster::block_on(Self::create(instance, Some(surface)))
    }

    async fn create(
        instance: wgpu::Instance,
        surface: Option<wgpu::Surface<'static>>,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RenderError::AdapterRequestFailed(e.to_string()))?;

        let bindless = wgpu::Features::TEXTURE_BINDING_ARRAY
            | wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING;
        if !adapter.features().contains(bindless) {
            return Err(RenderError::AdapterRequestFailed(format!(
                "'{}' does not support texture binding arrays",
                adapter.get_info().name
            )));
        }
        let optional = wgpu::Features::PARTIALLY_BOUND_BINDING_ARRAY
            | wgpu::Features::DEPTH_CLIP_CONTROL;
        let features = bindless | (adapter.features() & optional);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Ember Device"),
                required_features: features,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .map_err(|e| RenderError::DeviceCreateFailed(e.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "GPU: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.device_type, adapter_info.backend
        );
        let depth_clamp = features.contains(wgpu::Features::DEPTH_CLIP_CONTROL);
        let constants = ConstantRing::new(&device, 256);
        let blitter = MipBlitter::new(&device);

        Ok(Self {
            info: DeviceInfo {
                name: adapter_info.name,
                clip_y_down: false,
                supports_depth_clamp: depth_clamp,
            },
            device,
            queue,
            adapter,
            surface,
            depth_clamp,
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            layouts: SlotMap::with_key(),
            tables: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            semaphores: SlotMap::with_key(),
            chains: SlotMap::with_key(),
            constants,
            blitter,
        })
    }

    #[must_use]
    pub fn raw_device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn texture(&self, image: ImageHandle) -> Result<&wgpu::Texture> {
        let img = self.images.get(image).ok_or_else(|| invalid("image"))?;
        match &img.backing {
            ImageBacking::Texture(texture) => Ok(texture),
            ImageBacking::Surface(chain) => self
                .chains
                .get(*chain)
                .and_then(|c| c.current.as_ref())
                .map(|frame| &frame.texture)
                .ok_or_else(|| {
                    RenderError::device(
                        DeviceErrorCode::InvalidHandle,
                        format!("'{}' used without an acquired surface texture", img.label),
                    )
                }),
        }
    }

    fn attachment_view(&self, image: ImageHandle, layer: u32, mip: u32) -> Result<wgpu::TextureView> {
        Ok(self.texture(image)?.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: mip,
            mip_level_count: Some(1),
            base_array_layer: layer,
            array_layer_count: Some(1),
            ..Default::default()
        }))
    }

    fn wait(&self, index: Option<wgpu::SubmissionIndex>) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: index,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| RenderError::device(DeviceErrorCode::SubmissionFailed, e.to_string()))
    }

    // ========================================================================
    // Submission preparation
    // ========================================================================

    fn build_group(&self, table: &WgpuTable) -> Result<wgpu::BindGroup> {
        enum Owned<'a> {
            Buffer(&'a wgpu::Buffer),
            Views(Vec<wgpu::TextureView>, bool),
            Samplers(Vec<&'a wgpu::Sampler>, bool),
        }

        let layout = self
            .layouts
            .get(table.layout)
            .ok_or_else(|| invalid("binding layout"))?;
        let mut owned = Vec::with_capacity(layout.entries.len());
        for entry in &layout.entries {
            let resource = table.bindings.get(&entry.binding).ok_or_else(|| {
                RenderError::device(
                    DeviceErrorCode::Unknown,
                    format!("'{}' has no resource at binding {}", table.label, entry.binding),
                )
            })?;
            let resource = match (resource, entry.kind) {
                (BindingResource::Buffer(buffer), _) => Owned::Buffer(
                    &self.buffers.get(*buffer).ok_or_else(|| invalid("buffer"))?.buffer,
                ),
                (
                    BindingResource::Textures(images),
                    BindingKind::Texture {
                        dimension, count, ..
                    },
                ) => {
                    let mut views = images
                        .iter()
                        .map(|image| {
                            Ok(self.texture(*image)?.create_view(&wgpu::TextureViewDescriptor {
                                dimension: Some(dimension),
                                ..Default::default()
                            }))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    pad_to(&mut views, count);
                    Owned::Views(views, count > 1)
                }
                (BindingResource::Samplers(samplers), BindingKind::Sampler { count, .. }) => {
                    let mut refs = samplers
                        .iter()
                        .map(|s| self.samplers.get(*s).ok_or_else(|| invalid("sampler")))
                        .collect::<Result<Vec<_>>>()?;
                    pad_to(&mut refs, count);
                    Owned::Samplers(refs, count > 1)
                }
                _ => {
                    return Err(RenderError::device(
                        DeviceErrorCode::Unknown,
                        format!("'{}' binding {} has the wrong kind", table.label, entry.binding),
                    ));
                }
            };
            owned.push((entry.binding, resource));
        }

        let view_refs: Vec<Vec<&wgpu::TextureView>> = owned
            .iter()
            .map(|(_, resource)| match resource {
                Owned::Views(views, _) => views.iter().collect(),
                _ => Vec::new(),
            })
            .collect();
        let mut entries = Vec::with_capacity(owned.len());
        for ((binding, resource), refs) in owned.iter().zip(&view_refs) {
            let resource = match resource {
                Owned::Buffer(buffer) => buffer.as_entire_binding(),
                Owned::Views(_, true) => wgpu::BindingResource::TextureViewArray(refs),
                Owned::Views(views, false) => match views.first() {
                    Some(view) => wgpu::BindingResource::TextureView(view),
                    None => return Err(empty_binding(&table.label, *binding)),
                },
                Owned::Samplers(samplers, true) => wgpu::BindingResource::SamplerArray(samplers),
                Owned::Samplers(samplers, false) => match samplers.first() {
                    Some(sampler) => wgpu::BindingResource::Sampler(sampler),
                    None => return Err(empty_binding(&table.label, *binding)),
                },
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&table.label),
            layout: &layout.layout,
            entries: &entries,
        }))
    }

    /// Rebuilds the bind groups of every table the list binds that was
    /// written since its last use.
    fn prepare_tables(&mut self, commands: &CommandList) -> Result<()> {
        for command in commands.iter() {
            let Command::SetBindingTable { table, .. } = command else {
                continue;
            };
            let entry = self.tables.get(*table).ok_or_else(|| invalid("binding table"))?;
            if entry.group.is_some() {
                continue;
            }
            let group = self.build_group(entry)?;
            if let Some(entry) = self.tables.get_mut(*table) {
                entry.group = Some(group);
            }
        }
        Ok(())
    }

    fn upload_images(&self, commands: &CommandList) -> Result<()> {
        for command in commands.iter() {
            let &Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                layer,
                width,
                height,
            } = command
            else {
                continue;
            };
            let mirror = self
                .buffers
                .get(src)
                .ok_or_else(|| invalid("buffer"))?
                .mirror
                .as_ref()
                .ok_or_else(|| {
                    RenderError::device(
                        DeviceErrorCode::Unknown,
                        "image upload from a buffer that is not host-visible",
                    )
                })?;
            let format = self.images.get(dst).ok_or_else(|| invalid("image"))?.format;
            let texel = format.block_copy_size(None).unwrap_or(4);
            let len = u64::from(width) * u64::from(height) * u64::from(texel);
            let start = src_offset as usize;
            let data = mirror.get(start..start + len as usize).ok_or_else(|| {
                RenderError::device(DeviceErrorCode::Unknown, "image upload past end of buffer")
            })?;
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: self.texture(dst)?,
                    mip_level: 0,
                    origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * texel),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }
        Ok(())
    }

    fn prepare_blits(&mut self, commands: &CommandList) -> Result<Vec<PreparedBlit>> {
        let mut blits = Vec::new();
        for command in commands.iter() {
            let &Command::BlitMip { image, src_mip } = command else {
                continue;
            };
            let format = self.images.get(image).ok_or_else(|| invalid("image"))?.format;
            self.blitter.ensure_pipeline(&self.device, format);
            let source = self.attachment_view(image, 0, src_mip)?;
            let target = self.attachment_view(image, 0, src_mip + 1)?;
            let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Mip Blit Group"),
                layout: &self.blitter.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&source),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.blitter.sampler),
                    },
                ],
            });
            blits.push(PreparedBlit {
                group,
                target,
                format,
            });
        }
        Ok(blits)
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    fn begin_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        info: &RenderingInfo,
    ) -> Result<wgpu::RenderPass<'static>> {
        let color_views = info
            .color
            .iter()
            .map(|c| self.attachment_view(c.image, c.layer, 0))
            .collect::<Result<Vec<_>>>()?;
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = info
            .color
            .iter()
            .zip(&color_views)
            .map(|(c, view)| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: load_op(c.load),
                        store: store_op(c.store),
                    },
                    depth_slice: None,
                })
            })
            .collect();
        let depth_view = info
            .depth
            .map(|d| self.attachment_view(d.image, d.layer, 0))
            .transpose()?;
        let depth_stencil_attachment = info.depth.zip(depth_view.as_ref()).map(|(d, view)| {
            wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: load_op(d.load),
                    store: store_op(d.store),
                }),
                stencil_ops: None,
            }
        });
        Ok(encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(info.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            })
            .forget_lifetime())
    }

    fn replay_state(&self, pass: &mut wgpu::RenderPass<'static>, state: &EncodeState) {
        if let Some(pipeline) = state.pipeline.and_then(|p| self.pipelines.get(p)) {
            pass.set_pipeline(&pipeline.pipeline);
            if let (Some(group), Some(offset)) = (pipeline.constants_group, state.constants_offset) {
                pass.set_bind_group(group, &self.constants.group, &[offset]);
            }
        }
        for (index, table) in &state.tables {
            if let Some(group) = self.tables.get(*table).and_then(|t| t.group.as_ref()) {
                pass.set_bind_group(*index, group, &[]);
            }
        }
        if let Some(buffer) = state.vertex_buffer.and_then(|b| self.buffers.get(b)) {
            pass.set_vertex_buffer(0, buffer.buffer.slice(..));
        }
        if let Some(buffer) = state.index_buffer.and_then(|b| self.buffers.get(b)) {
            pass.set_index_buffer(buffer.buffer.slice(..), wgpu::IndexFormat::Uint32);
        }
    }

    fn encode(&self, commands: &CommandList, blits: &[PreparedBlit]) -> Result<wgpu::CommandBuffer> {
        let outside = |what: &str| {
            RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                format!("'{}': {what} outside a rendering scope", commands.label),
            )
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(commands.label),
            });
        let mut pass: Option<wgpu::RenderPass<'static>> = None;
        let mut state = EncodeState::default();
        let mut constant_blocks = 0u64;
        let mut blits = blits.iter();

        for command in commands.iter() {
            match command {
                Command::Barrier(_) | Command::CopyBufferToImage { .. } => {}
                Command::BeginRendering(info) => {
                    let mut begun = self.begin_pass(&mut encoder, info)?;
                    self.replay_state(&mut begun, &state);
                    pass = Some(begun);
                }
                Command::EndRendering => pass = None,
                Command::SetPipeline(handle) => {
                    let pipeline = self.pipelines.get(*handle).ok_or_else(|| invalid("pipeline"))?;
                    state.pipeline = Some(*handle);
                    if let Some(pass) = pass.as_mut() {
                        pass.set_pipeline(&pipeline.pipeline);
                        if let (Some(group), Some(offset)) =
                            (pipeline.constants_group, state.constants_offset)
                        {
                            pass.set_bind_group(group, &self.constants.group, &[offset]);
                        }
                    }
                }
                Command::SetBindingTable { index, table } => {
                    let group = self
                        .tables
                        .get(*table)
                        .and_then(|t| t.group.as_ref())
                        .ok_or_else(|| invalid("binding table"))?;
                    state.tables.insert(*index, *table);
                    if let Some(pass) = pass.as_mut() {
                        pass.set_bind_group(*index, group, &[]);
                    }
                }
                Command::SetConstants(_) => {
                    let offset = (constant_blocks * CONSTANTS_STRIDE) as u32;
                    constant_blocks += 1;
                    state.constants_offset = Some(offset);
                    let group = state
                        .pipeline
                        .and_then(|p| self.pipelines.get(p))
                        .and_then(|p| p.constants_group);
                    if let (Some(pass), Some(group)) = (pass.as_mut(), group) {
                        pass.set_bind_group(group, &self.constants.group, &[offset]);
                    }
                }
                Command::SetVertexBuffer(buffer) => {
                    let raw = &self.buffers.get(*buffer).ok_or_else(|| invalid("buffer"))?.buffer;
                    state.vertex_buffer = Some(*buffer);
                    if let Some(pass) = pass.as_mut() {
                        pass.set_vertex_buffer(0, raw.slice(..));
                    }
                }
                Command::SetIndexBuffer(buffer) => {
                    let raw = &self.buffers.get(*buffer).ok_or_else(|| invalid("buffer"))?.buffer;
                    state.index_buffer = Some(*buffer);
                    if let Some(pass) = pass.as_mut() {
                        pass.set_index_buffer(raw.slice(..), wgpu::IndexFormat::Uint32);
                    }
                }
                &Command::DrawIndexed {
                    index_count,
                    first_index,
                    vertex_offset,
                } => {
                    let pass = pass.as_mut().ok_or_else(|| outside("draw"))?;
                    pass.draw_indexed(first_index..first_index + index_count, vertex_offset, 0..1);
                }
                &Command::Draw { vertex_count } => {
                    let pass = pass.as_mut().ok_or_else(|| outside("draw"))?;
                    pass.draw(0..vertex_count, 0..1);
                }
                &Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src = &self.buffers.get(src).ok_or_else(|| invalid("buffer"))?.buffer;
                    let dst = &self.buffers.get(dst).ok_or_else(|| invalid("buffer"))?.buffer;
                    encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
                }
                Command::BlitMip { .. } => {
                    let blit = blits.next().ok_or_else(|| {
                        RenderError::device(DeviceErrorCode::Unknown, "mip blit was not prepared")
                    })?;
                    let pipeline = self.blitter.pipelines.get(&blit.format).ok_or_else(|| {
                        RenderError::device(DeviceErrorCode::Unknown, "mip blit pipeline missing")
                    })?;
                    let mut blit_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Mip Blit"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &blit.target,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                                store: wgpu::StoreOp::Store,
                            },
                            depth_slice: None,
                        })],
                        ..Default::default()
                    });
                    blit_pass.set_pipeline(pipeline);
                    blit_pass.set_bind_group(0, &blit.group, &[]);
                    blit_pass.draw(0..3, 0..1);
                }
                Command::DebugMarker(label) => match pass.as_mut() {
                    Some(pass) => pass.insert_debug_marker(label),
                    None => encoder.insert_debug_marker(label),
                },
            }
        }
        drop(pass);
        Ok(encoder.finish())
    }
}

fn empty_binding(table: &str, binding: u32) -> RenderError {
    RenderError::device(
        DeviceErrorCode::Unknown,
        format!("'{table}' binding {binding} is empty"),
    )
}

impl GpuDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    // === Buffers ===

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        // Host writes go through the queue, so mapping flags become copy targets.
        let mut usage = desc.usage - (wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::MAP_WRITE);
        if desc.host_visible {
            usage |= wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        }
        // Queue writes move whole words.
        let size = desc.size.max(4).next_multiple_of(4);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        Ok(self.buffers.insert(WgpuBuffer {
            buffer,
            mirror: desc.host_visible.then(|| vec![0; size as usize]),
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let entry = self.buffers.remove(buffer).ok_or_else(|| invalid("buffer"))?;
        entry.buffer.destroy();
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let entry = self.buffers.get_mut(buffer).ok_or_else(|| invalid("buffer"))?;
        let mirror = entry.mirror.as_mut().ok_or_else(|| {
            RenderError::device(DeviceErrorCode::Unknown, "write into a device-local buffer")
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mirror.len() {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("write of {} bytes at {offset} overruns the buffer", data.len()),
            ));
        }
        mirror[start..end].copy_from_slice(data);
        // Widen unaligned writes to whole words taken from the mirror.
        let aligned_start = start & !3;
        let aligned_end = end.next_multiple_of(4);
        self.queue.write_buffer(
            &entry.buffer,
            aligned_start as u64,
            &mirror[aligned_start..aligned_end],
        );
        Ok(())
    }

    // === Images & samplers ===

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle> {
        if desc.extent().is_zero_area() || desc.layers == 0 || desc.mip_levels == 0 {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("degenerate image '{}'", desc.label),
            ));
        }
        let mut usage = desc.usage | wgpu::TextureUsages::COPY_DST;
        if desc.mip_levels > 1 {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage,
            view_formats: &[],
        });
        Ok(self.images.insert(WgpuImage {
            label: desc.label.to_string(),
            backing: ImageBacking::Texture(texture),
            format: desc.format,
        }))
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        match self.images.get(image).map(|i| &i.backing) {
            Some(ImageBacking::Surface(_)) => Err(RenderError::device(
                DeviceErrorCode::InvalidHandle,
                "image belongs to an output chain",
            )),
            Some(ImageBacking::Texture(texture)) => {
                texture.destroy();
                self.images.remove(image);
                Ok(())
            }
            None => Err(invalid("image")),
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: desc.address_mode[0],
            address_mode_v: desc.address_mode[1],
            address_mode_w: desc.address_mode[2],
            mag_filter: desc.mag_filter,
            min_filter: desc.min_filter,
            mipmap_filter: desc.mipmap_filter,
            compare: desc.compare,
            anisotropy_clamp: desc.anisotropy.max(1),
            border_color: desc.border_color,
            ..Default::default()
        });
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        self.samplers.remove(sampler).map(|_| ()).ok_or_else(|| invalid("sampler"))
    }

    // === Binding tables ===

    fn create_binding_layout(
        &mut self,
        desc: &BindingLayoutDesc<'_>,
    ) -> Result<BindingLayoutHandle> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = desc.entries.iter().map(layout_entry).collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &entries,
            });
        Ok(self.layouts.insert(WgpuLayout {
            layout,
            entries: desc.entries.to_vec(),
        }))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) -> Result<()> {
        self.layouts.remove(layout).map(|_| ()).ok_or_else(|| invalid("binding layout"))
    }

    fn create_binding_table(
        &mut self,
        label: &str,
        layout: BindingLayoutHandle,
    ) -> Result<BindingTableHandle> {
        if !self.layouts.contains_key(layout) {
            return Err(invalid("binding layout"));
        }
        Ok(self.tables.insert(WgpuTable {
            label: label.to_string(),
            layout,
            bindings: FxHashMap::default(),
            group: None,
        }))
    }

    fn write_binding_table(
        &mut self,
        table: BindingTableHandle,
        writes: &[BindingWrite],
    ) -> Result<()> {
        let entry = self.tables.get_mut(table).ok_or_else(|| invalid("binding table"))?;
        for write in writes {
            entry.bindings.insert(write.binding, write.resource.clone());
        }
        entry.group = None;
        Ok(())
    }

    fn destroy_binding_table(&mut self, table: BindingTableHandle) -> Result<()> {
        self.tables.remove(table).map(|_| ()).ok_or_else(|| invalid("binding table"))
    }

    // === Shaders & pipelines ===

    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Option<ShaderModuleHandle> {
        use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

        let module = match wgpu::naga::front::wgsl::parse_str(&source.wgsl) {
            Ok(module) => module,
            Err(e) => {
                warn!("Shader '{}' failed to parse:\n{}", source.label, e.emit_to_string(&source.wgsl));
                return None;
            }
        };
        if let Err(e) = Validator::new(ValidationFlags::all(), Capabilities::all()).validate(&module) {
            warn!("Shader '{}' failed validation:\n{}", source.label, e.emit_to_string(&source.wgsl));
            return None;
        }
        if let Some(missing) = source
            .entry_points
            .iter()
            .find(|name| !module.entry_points.iter().any(|e| e.name == **name))
        {
            warn!("Shader '{}' has no entry point '{missing}'", source.label);
            return None;
        }
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.label),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.clone()),
        });
        Some(self.shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: ShaderModuleHandle) -> Result<()> {
        self.shaders.remove(shader).map(|_| ()).ok_or_else(|| invalid("shader"))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        let shader = self.shaders.get(desc.shader).ok_or_else(|| invalid("shader"))?;
        let mut layouts = desc
            .binding_layouts
            .iter()
            .map(|l| self.layouts.get(*l).map(|l| &l.layout).ok_or_else(|| invalid("binding layout")))
            .collect::<Result<Vec<_>>>()?;
        let constants_group = desc.uses_constants.then_some(layouts.len() as u32);
        if desc.uses_constants {
            layouts.push(&self.constants.layout);
        }
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &layouts,
                immediate_size: 0,
            });

        let mesh_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &MESH_ATTRIBUTES,
        }];
        let buffers: &[wgpu::VertexBufferLayout<'_>] = match desc.vertex_layout {
            VertexLayout::None => &[],
            VertexLayout::Mesh => &mesh_buffers,
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|t| {
                Some(wgpu::ColorTargetState {
                    format: t.format,
                    blend: t.blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let clamp = desc.depth.is_some_and(|d| d.clamp) && self.depth_clamp;

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some(desc.vertex_entry),
                    buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: desc.fragment_entry.map(|entry| wgpu::FragmentState {
                    module: shader,
                    entry_point: Some(entry),
                    targets: &targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: desc.topology,
                    cull_mode: desc.cull_mode,
                    unclipped_depth: clamp,
                    ..Default::default()
                },
                depth_stencil: desc.depth.map(|d| wgpu::DepthStencilState {
                    format: d.format,
                    depth_write_enabled: d.write,
                    depth_compare: d.compare,
                    stencil: wgpu::StencilState::default(),
                    bias: d.bias,
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            });
        Ok(self.pipelines.insert(WgpuPipeline {
            pipeline,
            constants_group,
        }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines.remove(pipeline).map(|_| ()).ok_or_else(|| invalid("pipeline"))
    }

    // === Synchronization ===

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle> {
        Ok(self.fences.insert(WgpuFence {
            signaled,
            pending: None,
        }))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()> {
        self.fences.remove(fence).map(|_| ()).ok_or_else(|| invalid("fence"))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> Result<()> {
        let entry = self.fences.get_mut(fence).ok_or_else(|| invalid("fence"))?;
        if let Some((index, _)) = entry.pending.take() {
            entry.signaled = true;
            self.wait(Some(index))?;
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()> {
        let entry = self.fences.get_mut(fence).ok_or_else(|| invalid("fence"))?;
        entry.signaled = false;
        entry.pending = None;
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceHandle) -> Result<bool> {
        let entry = self.fences.get(fence).ok_or_else(|| invalid("fence"))?;
        match &entry.pending {
            None => Ok(entry.signaled),
            Some((_, done)) => {
                self.device
                    .poll(wgpu::PollType::Poll)
                    .map_err(|e| RenderError::device(DeviceErrorCode::SubmissionFailed, e.to_string()))?;
                Ok(done.load(Ordering::Acquire))
            }
        }
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle> {
        Ok(self.semaphores.insert(()))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()> {
        self.semaphores.remove(semaphore).map(|_| ()).ok_or_else(|| invalid("semaphore"))
    }

    // === Submission ===

    fn submit(&mut self, commands: CommandList, info: &SubmitInfo) -> Result<()> {
        if info
            .waits
            .iter()
            .chain(&info.signals)
            .any(|s| !self.semaphores.contains_key(*s))
        {
            return Err(invalid("semaphore"));
        }
        if let Some(fence) = info.fence {
            let entry = self.fences.get(fence).ok_or_else(|| invalid("fence"))?;
            if entry.signaled {
                return Err(RenderError::device(
                    DeviceErrorCode::SubmissionFailed,
                    format!("'{}' submitted with a fence that was never reset", commands.label),
                ));
            }
        }

        self.prepare_tables(&commands)?;
        self.constants.upload(&self.device, &self.queue, &commands);
        self.upload_images(&commands)?;
        let blits = self.prepare_blits(&commands)?;
        let buffer = self.encode(&commands, &blits)?;

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        self.queue
            .on_submitted_work_done(move || flag.store(true, Ordering::Release));
        let index = self.queue.submit([buffer]);
        if let Some(fence) = info.fence.and_then(|f| self.fences.get_mut(f)) {
            fence.pending = Some((index, done));
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.wait(None)
    }

    // === Presentation ===

    fn create_output_chain(&mut self, desc: &OutputChainDesc) -> Result<OutputChain> {
        let surface = self.surface.as_ref().ok_or_else(|| {
            RenderError::device(DeviceErrorCode::SurfaceLost, "device was opened without a window")
        })?;
        if desc.extent.is_zero_area() {
            return Err(RenderError::device(
                DeviceErrorCode::SurfaceLost,
                "output chain with zero area",
            ));
        }
        let mut config = surface
            .get_default_config(&self.adapter, desc.extent.width, desc.extent.height)
            .ok_or_else(|| {
                RenderError::device(DeviceErrorCode::SurfaceLost, "surface not supported by adapter")
            })?;
        let caps = surface.get_capabilities(&self.adapter);
        if caps.formats.contains(&desc.format) {
            config.format = desc.format;
        } else {
            warn!(
                "Surface does not support {:?}; presenting as {:?}",
                desc.format, config.format
            );
        }
        config.present_mode = if desc.vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };
        config.usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC;
        surface.configure(&self.device, &config);

        let count = config.desired_maximum_frame_latency + 1;
        let format = config.format;
        let handle = self.chains.insert(WgpuChain {
            images: Vec::new(),
            next: 0,
            current: None,
        });
        let images: Vec<ImageHandle> = (0..count)
            .map(|i| {
                self.images.insert(WgpuImage {
                    label: format!("Output Image {i}"),
                    backing: ImageBacking::Surface(handle),
                    format,
                })
            })
            .collect();
        if let Some(chain) = self.chains.get_mut(handle) {
            chain.images.clone_from(&images);
        }
        debug!(
            "Configured surface {}x{} ({count} images)",
            desc.extent.width, desc.extent.height
        );
        Ok(OutputChain {
            handle,
            images,
            format,
            extent: desc.extent,
        })
    }

    fn destroy_output_chain(&mut self, chain: OutputChainHandle) -> Result<()> {
        let chain = self.chains.remove(chain).ok_or_else(|| invalid("output chain"))?;
        for image in chain.images {
            self.images.remove(image);
        }
        Ok(())
    }

    fn acquire_next_image(
        &mut self,
        chain: OutputChainHandle,
        signal: SemaphoreHandle,
    ) -> Result<AcquireOutcome> {
        if !self.semaphores.contains_key(signal) {
            return Err(invalid("semaphore"));
        }
        let surface = self.surface.as_ref().ok_or_else(|| invalid("output chain"))?;
        let entry = self.chains.get_mut(chain).ok_or_else(|| invalid("output chain"))?;
        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost | wgpu::SurfaceError::Timeout) => {
                return Ok(AcquireOutcome::OutOfDate);
            }
            Err(e) => {
                return Err(RenderError::device(DeviceErrorCode::SurfaceLost, e.to_string()));
            }
        };
        let suboptimal = frame.suboptimal;
        entry.current = Some(frame);
        let index = entry.next;
        entry.next = (entry.next + 1) % entry.images.len() as u32;
        Ok(if suboptimal {
            AcquireOutcome::Suboptimal(index)
        } else {
            AcquireOutcome::Ready(index)
        })
    }

    fn present(
        &mut self,
        chain: OutputChainHandle,
        _image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome> {
        if !self.semaphores.contains_key(wait) {
            return Err(invalid("semaphore"));
        }
        let entry = self.chains.get_mut(chain).ok_or_else(|| invalid("output chain"))?;
        let frame = entry.current.take().ok_or_else(|| {
            RenderError::device(DeviceErrorCode::SubmissionFailed, "present without an acquired image")
        })?;
        frame.present();
        Ok(PresentOutcome::Presented)
    }
}
