//! Tone mapping.
//!
//! Full-screen triangle sampling the HDR color target into the output image.
//! Exposure and curve travel as push constants, so changing them never
//! touches a binding table.

use log::warn;
use smallvec::smallvec;

use crate::errors::Result;
use crate::frame::DirtyFlags;
use crate::gpu::{
    BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle, BindingResource,
    BindingTableHandle, BindingWrite, ColorAttachment, ColorTargetDesc, CommandRecorder,
    GpuDevice, ImageBarrier, ImageLayout, LoadOp, PipelineDesc, PipelineHandle, PushConstants,
    RenderingInfo, SamplerDesc, SamplerHandle, ShaderCompiler, ShaderModuleHandle, VertexLayout,
};
use crate::passes::{FrameContext, RenderNode};
use crate::settings::ToneMapSettings;

pub struct ToneMapPass {
    layout: BindingLayoutHandle,
    shader: Option<ShaderModuleHandle>,
    pipeline: Option<PipelineHandle>,
    sampler: SamplerHandle,
    tables: Vec<BindingTableHandle>,
    pub settings: ToneMapSettings,
}

impl ToneMapPass {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        compiler: &ShaderCompiler,
        output_format: wgpu::TextureFormat,
        settings: ToneMapSettings,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let layout = device.create_binding_layout(&BindingLayoutDesc {
            label: "Tone Map Layout",
            entries: &[
                BindingLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Texture {
                        dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        count: 1,
                    },
                },
                BindingLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Sampler {
                        comparison: false,
                        count: 1,
                    },
                },
            ],
        })?;

        let shader = compiler.compile(device, "tone_mapping", &["vs_main", "fs_main"]);
        let pipeline = match shader {
            Some(shader) => Some(device.create_pipeline(&PipelineDesc {
                label: "Tone Map Pipeline",
                shader,
                vertex_entry: "vs_main",
                fragment_entry: Some("fs_main"),
                vertex_layout: VertexLayout::None,
                binding_layouts: &[layout],
                uses_constants: true,
                color_targets: &[ColorTargetDesc {
                    format: output_format,
                    blend: None,
                }],
                depth: None,
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
            })?),
            None => {
                warn!("Tone mapping shader unavailable; output will only be cleared");
                None
            }
        };

        let sampler = device.create_sampler(&SamplerDesc {
            address_mode: [wgpu::AddressMode::ClampToEdge; 3],
            ..Default::default()
        })?;

        let tables = (0..frames_in_flight)
            .map(|_| device.create_binding_table("Tone Map Bindings", layout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            shader,
            pipeline,
            sampler,
            tables,
            settings,
        })
    }

    #[must_use]
    pub fn constants(&self) -> PushConstants {
        PushConstants::from_mixed(&[self.settings.mode.shader_id()], &[self.settings.exposure])
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
        device.destroy_sampler(self.sampler)?;
        device.destroy_binding_layout(self.layout)
    }
}

impl RenderNode for ToneMapPass {
    fn name(&self) -> &'static str {
        "Tone Map Pass"
    }

    fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FrameContext<'_>,
        dirty: &mut DirtyFlags,
    ) -> Result<()> {
        if dirty.contains(DirtyFlags::TONE_MAP_BINDINGS) {
            device.write_binding_table(
                self.tables[frame.slot],
                &[
                    BindingWrite {
                        binding: 0,
                        resource: BindingResource::Textures(smallvec![frame.targets.color]),
                    },
                    BindingWrite {
                        binding: 1,
                        resource: BindingResource::Samplers(smallvec![self.sampler]),
                    },
                ],
            )?;
            dirty.remove(DirtyFlags::TONE_MAP_BINDINGS);
        }
        Ok(())
    }

    fn run(&self, frame: &FrameContext<'_>, recorder: &mut CommandRecorder) {
        recorder.barrier(ImageBarrier::whole(
            frame.targets.color,
            ImageLayout::ColorAttachment,
            ImageLayout::ShaderReadOnly,
        ));
        recorder.barrier(ImageBarrier::whole(
            frame.output,
            ImageLayout::Undefined,
            ImageLayout::ColorAttachment,
        ));
        recorder.begin_rendering(RenderingInfo {
            label: "Tone Map Pass",
            color: smallvec![ColorAttachment {
                image: frame.output,
                layer: 0,
                load: LoadOp::Clear(wgpu::Color::BLACK),
                store: true,
            }],
            depth: None,
            extent: frame.output_extent,
        });
        if let Some(pipeline) = self.pipeline {
            recorder.set_pipeline(pipeline);
            recorder.set_binding_table(0, self.tables[frame.slot]);
            recorder.set_constants(self.constants());
            recorder.draw(3);
        }
        recorder.end_rendering();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::settings::{RendererSettings, ToneMapMode};

    #[test]
    fn constants_carry_mode_then_exposure() {
        let mut device = HeadlessDevice::new();
        let compiler = ShaderCompiler::new(&RendererSettings::default(), true).unwrap();
        let pass = ToneMapPass::new(
            &mut device,
            &compiler,
            wgpu::TextureFormat::Bgra8UnormSrgb,
            ToneMapSettings {
                exposure: 2.5,
                mode: ToneMapMode::Reinhard,
            },
            1,
        )
        .unwrap();

        let c = pass.constants();
        assert_eq!(c.word(0), ToneMapMode::Reinhard.shader_id());
        assert_eq!(c.float(1), 2.5);
        assert!(c.0[2..].iter().all(|&w| w == 0));
        pass.destroy(&mut device).unwrap();
    }
}
