//! Lit geometry pass.
//!
//! Renders every live object into the HDR color target with one global
//! binding table per slot: camera, objects, materials, lights, the bindless
//! texture and sampler arrays, the shadow-map array with its comparison
//! sampler, and the cascade records. Bindless entries past the populated
//! count stay unbound and are never indexed.

use log::{debug, warn};
use smallvec::{SmallVec, smallvec};

use crate::errors::Result;
use crate::frame::DirtyFlags;
use crate::gpu::{
    BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle, BindingResource,
    BindingTableHandle, BindingWrite, ColorAttachment, ColorTargetDesc, CommandRecorder,
    DepthAttachment, DepthDesc, GpuDevice, ImageBarrier, ImageHandle, ImageLayout, LoadOp,
    PipelineDesc, PipelineHandle, PushConstants, RenderingInfo, SamplerDesc, SamplerHandle,
    ShaderCompiler, ShaderModuleHandle, VertexLayout,
};
use crate::passes::{FrameContext, RenderNode};
use crate::settings::RendererSettings;

const FRAGMENT: wgpu::ShaderStages = wgpu::ShaderStages::FRAGMENT;
const VERTEX_FRAGMENT: wgpu::ShaderStages = wgpu::ShaderStages::VERTEX_FRAGMENT;

fn layout_entries(settings: &RendererSettings) -> [BindingLayoutEntry; 9] {
    let storage = BindingKind::Storage { read_only: true };
    [
        BindingLayoutEntry {
            binding: 0,
            visibility: VERTEX_FRAGMENT,
            kind: BindingKind::Uniform,
        },
        BindingLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::VERTEX,
            kind: storage,
        },
        BindingLayoutEntry {
            binding: 2,
            visibility: FRAGMENT,
            kind: storage,
        },
        BindingLayoutEntry {
            binding: 3,
            visibility: FRAGMENT,
            kind: storage,
        },
        BindingLayoutEntry {
            binding: 4,
            visibility: FRAGMENT,
            kind: BindingKind::Texture {
                dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                count: settings.max_textures,
            },
        },
        BindingLayoutEntry {
            binding: 5,
            visibility: FRAGMENT,
            kind: BindingKind::Sampler {
                comparison: false,
                count: settings.max_textures,
            },
        },
        BindingLayoutEntry {
            binding: 6,
            visibility: FRAGMENT,
            kind: BindingKind::Texture {
                dimension: wgpu::TextureViewDimension::D2Array,
                sample_type: wgpu::TextureSampleType::Depth,
                count: settings.max_shadow_maps,
            },
        },
        BindingLayoutEntry {
            binding: 7,
            visibility: FRAGMENT,
            kind: BindingKind::Sampler {
                comparison: true,
                count: 1,
            },
        },
        BindingLayoutEntry {
            binding: 8,
            visibility: FRAGMENT,
            kind: storage,
        },
    ]
}

pub struct MainPass {
    layout: BindingLayoutHandle,
    shader: Option<ShaderModuleHandle>,
    pipeline: Option<PipelineHandle>,
    shadow_sampler: SamplerHandle,
    tables: Vec<BindingTableHandle>,
    clear_color: wgpu::Color,
}

impl MainPass {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        compiler: &ShaderCompiler,
        settings: &RendererSettings,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let entries = layout_entries(settings);
        let layout = device.create_binding_layout(&BindingLayoutDesc {
            label: "Main Layout",
            entries: &entries,
        })?;

        let shader = compiler.compile(device, "main", &["vs_main", "fs_main"]);
        let pipeline = match shader {
            Some(shader) => Some(device.create_pipeline(&PipelineDesc {
                label: "Main Pipeline",
                shader,
                vertex_entry: "vs_main",
                fragment_entry: Some("fs_main"),
                vertex_layout: VertexLayout::Mesh,
                binding_layouts: &[layout],
                uses_constants: true,
                color_targets: &[ColorTargetDesc {
                    format: settings.color_format,
                    blend: None,
                }],
                depth: Some(DepthDesc {
                    format: settings.depth_format,
                    write: true,
                    compare: wgpu::CompareFunction::Less,
                    clamp: false,
                    bias: wgpu::DepthBiasState::default(),
                }),
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
            })?),
            None => {
                warn!("Main shader unavailable; geometry will not be drawn");
                None
            }
        };

        let shadow_sampler = device.create_sampler(&SamplerDesc {
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            address_mode: [wgpu::AddressMode::ClampToEdge; 3],
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        })?;

        let tables = (0..frames_in_flight)
            .map(|_| device.create_binding_table("Main Bindings", layout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            shader,
            pipeline,
            shadow_sampler,
            tables,
            clear_color: settings.clear_color,
        })
    }

    #[must_use]
    pub fn table(&self, slot: usize) -> BindingTableHandle {
        self.tables[slot]
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for table in self.tables {
            device.destroy_binding_table(table)?;
        }
        if let Some(pipeline) = self.pipeline {
            device.destroy_pipeline(pipeline)?;
        }
        if let Some(shader) = self.shader {
            device.destroy_shader(shader)?;
        }
        device.destroy_sampler(self.shadow_sampler)?;
        device.destroy_binding_layout(self.layout)
    }
}

impl RenderNode for MainPass {
    fn name(&self) -> &'static str {
        "Main Pass"
    }

    fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FrameContext<'_>,
        dirty: &mut DirtyFlags,
    ) -> Result<()> {
        if !dirty.contains(DirtyFlags::MAIN_BINDINGS) {
            return Ok(());
        }
        let (textures, samplers) = frame.textures.bindless_arrays();
        let mut shadow_maps: SmallVec<[ImageHandle; 4]> = frame.shadows.images();
        if shadow_maps.is_empty() {
            shadow_maps.push(frame.dummy_shadow_map);
        }
        let buffers = frame.buffers;
        device.write_binding_table(
            self.tables[frame.slot],
            &[
                BindingWrite {
                    binding: 0,
                    resource: BindingResource::Buffer(buffers.camera),
                },
                BindingWrite {
                    binding: 1,
                    resource: BindingResource::Buffer(buffers.objects),
                },
                BindingWrite {
                    binding: 2,
                    resource: BindingResource::Buffer(buffers.materials),
                },
                BindingWrite {
                    binding: 3,
                    resource: BindingResource::Buffer(buffers.lights),
                },
                BindingWrite {
                    binding: 4,
                    resource: BindingResource::Textures(textures),
                },
                BindingWrite {
                    binding: 5,
                    resource: BindingResource::Samplers(samplers),
                },
                BindingWrite {
                    binding: 6,
                    resource: BindingResource::Textures(shadow_maps),
                },
                BindingWrite {
                    binding: 7,
                    resource: BindingResource::Samplers(smallvec![self.shadow_sampler]),
                },
                BindingWrite {
                    binding: 8,
                    resource: BindingResource::Buffer(buffers.cascades),
                },
            ],
        )?;
        debug!(
            "Rewrote main bindings of slot {} ({} textures)",
            frame.slot,
            frame.textures.texture_count()
        );
        dirty.remove(DirtyFlags::MAIN_BINDINGS);
        Ok(())
    }

    fn run(&self, frame: &FrameContext<'_>, recorder: &mut CommandRecorder) {
        let targets = frame.targets;
        recorder.barrier(ImageBarrier::whole(
            targets.color,
            ImageLayout::Undefined,
            ImageLayout::ColorAttachment,
        ));
        recorder.barrier(ImageBarrier::whole(
            targets.depth,
            ImageLayout::Undefined,
            ImageLayout::DepthAttachment,
        ));
        recorder.begin_rendering(RenderingInfo {
            label: "Main Pass",
            color: smallvec![ColorAttachment {
                image: targets.color,
                layer: 0,
                load: LoadOp::Clear(self.clear_color),
                store: true,
            }],
            depth: Some(DepthAttachment {
                image: targets.depth,
                layer: 0,
                load: LoadOp::Clear(1.0),
                store: false,
            }),
            extent: targets.extent,
        });
        if let Some(pipeline) = self.pipeline {
            recorder.set_pipeline(pipeline);
            recorder.set_binding_table(0, self.tables[frame.slot]);
            recorder.set_vertex_buffer(frame.geometry.vertex_buffer());
            recorder.set_index_buffer(frame.geometry.index_buffer());
            for draw in frame.draws {
                recorder.set_constants(PushConstants::from_words(&[draw.object]));
                recorder.draw_indexed(draw.index_count, draw.first_index, draw.vertex_offset);
            }
        }
        recorder.end_rendering();
    }
}
