//! Shadow depth pass.
//!
//! Every bound shadow map is rendered layer by layer: one rendering scope per
//! directional cascade, one per spot light. Each map is moved to
//! `DepthAttachment` right before its first layer is drawn and back to
//! `ShaderReadOnly` right after its last, so the main pass can sample it.

use bytemuck::{Pod, Zeroable};
use log::warn;
use smallvec::smallvec;

use crate::errors::Result;
use crate::frame::DirtyFlags;
use crate::gpu::{
    BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle, BindingResource,
    BindingTableHandle, BindingWrite, CommandRecorder, DepthAttachment, DepthDesc, Extent,
    GpuDevice, ImageBarrier, ImageHandle, ImageLayout, LoadOp, PipelineDesc, PipelineHandle, PushConstants,
    RenderingInfo, ShaderCompiler, ShaderModuleHandle, VertexLayout,
};
use crate::passes::{FrameContext, RenderNode};
use crate::settings::SHADOW_CASCADE_COUNT;
use crate::shadow::{ShadowBindings, ShadowSet};

/// One `mat4` per entry of the depth-pass matrix buffer.
pub const SHADOW_MATRIX_SIZE: u64 = 64;
pub const CASCADE_RECORD_SIZE: u64 = std::mem::size_of::<GpuCascade>() as u64;

/// Lighting-pass cascade record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuCascade {
    pub view_proj: [[f32; 4]; 4],
    /// x: split depth (0 for spot lights).
    pub split: [f32; 4],
}

/// Bytes of the matrix-only buffer and of the cascade buffer for a frame.
#[must_use]
pub fn shadow_buffer_bytes(set: &ShadowSet) -> (Vec<u8>, Vec<u8>) {
    let flat = set.flatten();
    let matrices: Vec<[[f32; 4]; 4]> = flat.iter().map(|m| m.view_proj.to_cols_array_2d()).collect();
    let cascades: Vec<GpuCascade> = flat
        .iter()
        .map(|m| GpuCascade {
            view_proj: m.view_proj.to_cols_array_2d(),
            split: [m.split_depth.unwrap_or(0.0), 0.0, 0.0, 0.0],
        })
        .collect();
    (
        bytemuck::cast_slice(&matrices).to_vec(),
        bytemuck::cast_slice(&cascades).to_vec(),
    )
}

pub struct ShadowPass {
    layout: BindingLayoutHandle,
    shader: Option<ShaderModuleHandle>,
    directional_pipeline: Option<PipelineHandle>,
    spot_pipeline: Option<PipelineHandle>,
    /// One table per frame slot.
    tables: Vec<BindingTableHandle>,
    resolution: u32,
}

impl ShadowPass {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        compiler: &ShaderCompiler,
        depth_format: wgpu::TextureFormat,
        resolution: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let layout = device.create_binding_layout(&BindingLayoutDesc {
            label: "Shadow Layout",
            entries: &[
                BindingLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    kind: BindingKind::Storage { read_only: true },
                },
                BindingLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    kind: BindingKind::Storage { read_only: true },
                },
            ],
        })?;

        let shader = compiler.compile(device, "shadow", &["vs_main"]);
        let (directional_pipeline, spot_pipeline) = match shader {
            Some(shader) => {
                // Depth clamp keeps casters behind the cascade's near plane.
                let clamp = device.info().supports_depth_clamp;
                let directional = Self::pipeline(
                    device,
                    "Directional Shadow Pipeline",
                    shader,
                    layout,
                    depth_format,
                    clamp,
                )?;
                let spot = Self::pipeline(
                    device,
                    "Spot Shadow Pipeline",
                    shader,
                    layout,
                    depth_format,
                    false,
                )?;
                (Some(directional), Some(spot))
            }
            None => {
                warn!("Shadow shader unavailable; shadow maps will only be cleared");
                (None, None)
            }
        };

        let tables = (0..frames_in_flight)
            .map(|_| device.create_binding_table("Shadow Bindings", layout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            shader,
            directional_pipeline,
            spot_pipeline,
            tables,
            resolution,
        })
    }

    fn pipeline<D: GpuDevice + ?Sized>(
        device: &mut D,
        label: &str,
        shader: ShaderModuleHandle,
        layout: BindingLayoutHandle,
        format: wgpu::TextureFormat,
        clamp: bool,
    ) -> Result<PipelineHandle> {
        device.create_pipeline(&PipelineDesc {
            label,
            shader,
            vertex_entry: "vs_main",
            fragment_entry: None,
            vertex_layout: VertexLayout::Mesh,
            binding_layouts: &[layout],
            uses_constants: true,
            color_targets: &[],
            depth: Some(DepthDesc {
                format,
                write: true,
                compare: wgpu::CompareFunction::LessEqual,
                clamp,
                bias: wgpu::DepthBiasState {
                    constant: 2,
                    slope_scale: 2.0,
                    clamp: 0.0,
                },
            }),
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
        })
    }

    fn record_map(
        &self,
        recorder: &mut CommandRecorder,
        frame: &FrameContext<'_>,
        image: ImageHandle,
        layers: u32,
        pipeline: Option<PipelineHandle>,
        first_matrix: u32,
    ) {
        recorder.barrier(ImageBarrier::layers(
            image,
            layers,
            ImageLayout::Undefined,
            ImageLayout::DepthAttachment,
        ));
        for layer in 0..layers {
            recorder.begin_rendering(RenderingInfo {
                label: "Shadow Depth Pass",
                color: smallvec![],
                depth: Some(DepthAttachment {
                    image,
                    layer,
                    load: LoadOp::Clear(1.0),
                    store: true,
                }),
                extent: Extent::new(self.resolution, self.resolution),
            });
            if let Some(pipeline) = pipeline {
                recorder.set_pipeline(pipeline);
                recorder.set_binding_table(0, self.tables[frame.slot]);
                recorder.set_vertex_buffer(frame.geometry.vertex_buffer());
                recorder.set_index_buffer(frame.geometry.index_buffer());
                for draw in frame.draws {
                    recorder.set_constants(PushConstants::from_words(&[
                        first_matrix + layer,
                        draw.object,
                    ]));
                    recorder.draw_indexed(draw.index_count, draw.first_index, draw.vertex_offset);
                }
            }
            recorder.end_rendering();
        }
        recorder.barrier(ImageBarrier::layers(
            image,
            layers,
            ImageLayout::DepthAttachment,
            ImageLayout::ShaderReadOnly,
        ));
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for table in self.tables {
            device.destroy_binding_table(table)?;
        }
        for pipeline in [self.directional_pipeline, self.spot_pipeline].into_iter().flatten() {
            device.destroy_pipeline(pipeline)?;
        }
        if let Some(shader) = self.shader {
            device.destroy_shader(shader)?;
        }
        device.destroy_binding_layout(self.layout)
    }
}

/// Matrix index of a bound map's first layer: directional maps own
/// `SHADOW_CASCADE_COUNT` consecutive matrices, spot maps follow with one each.
#[must_use]
pub fn first_matrix_index(bindings: &ShadowBindings, spot: bool, index: usize) -> u32 {
    let k = SHADOW_CASCADE_COUNT as u32;
    if spot {
        bindings.directional.len() as u32 * k + index as u32
    } else {
        index as u32 * k
    }
}

impl RenderNode for ShadowPass {
    fn name(&self) -> &'static str {
        "Shadow Pass"
    }

    fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FrameContext<'_>,
        dirty: &mut DirtyFlags,
    ) -> Result<()> {
        if dirty.contains(DirtyFlags::SHADOW_BINDINGS) {
            device.write_binding_table(
                self.tables[frame.slot],
                &[
                    BindingWrite {
                        binding: 0,
                        resource: BindingResource::Buffer(frame.buffers.objects),
                    },
                    BindingWrite {
                        binding: 1,
                        resource: BindingResource::Buffer(frame.buffers.shadow_matrices),
                    },
                ],
            )?;
            dirty.remove(DirtyFlags::SHADOW_BINDINGS);
        }
        Ok(())
    }

    fn run(&self, frame: &FrameContext<'_>, recorder: &mut CommandRecorder) {
        let shadows = frame.shadows;
        for (i, (_, map)) in shadows.directional.iter().enumerate() {
            self.record_map(
                recorder,
                frame,
                map.image,
                map.layers,
                self.directional_pipeline,
                first_matrix_index(shadows, false, i),
            );
        }
        for (j, (_, map)) in shadows.spot.iter().enumerate() {
            self.record_map(
                recorder,
                frame,
                map.image,
                map.layers,
                self.spot_pipeline,
                first_matrix_index(shadows, true, j),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::{ShadowCascade, ShadowMap};
    use crate::scene::LightKind;
    use glam::Mat4;

    #[test]
    fn cascade_records_carry_split_depth() {
        let cascade = ShadowCascade {
            view_proj: Mat4::IDENTITY,
            split_depth: -7.5,
        };
        let set = ShadowSet {
            directional: vec![[cascade; SHADOW_CASCADE_COUNT]],
            spot: vec![Mat4::IDENTITY],
        };
        let (matrices, cascades) = shadow_buffer_bytes(&set);
        assert_eq!(matrices.len() as u64, 5 * SHADOW_MATRIX_SIZE);
        assert_eq!(cascades.len() as u64, 5 * CASCADE_RECORD_SIZE);
        let first: GpuCascade = bytemuck::pod_read_unaligned(&cascades[..CASCADE_RECORD_SIZE as usize]);
        assert_eq!(first.split[0], -7.5);
        let spot: GpuCascade =
            bytemuck::pod_read_unaligned(&cascades[4 * CASCADE_RECORD_SIZE as usize..]);
        assert_eq!(spot.split[0], 0.0);
    }

    #[test]
    fn spot_matrices_follow_all_cascades() {
        let map = ShadowMap {
            image: crate::gpu::ImageHandle::default(),
            layers: 1,
            kind: LightKind::Spot,
        };
        let bindings = ShadowBindings {
            directional: vec![(1, map), (2, map)],
            spot: vec![(3, map)],
        };
        assert_eq!(first_matrix_index(&bindings, false, 1), SHADOW_CASCADE_COUNT as u32);
        assert_eq!(
            first_matrix_index(&bindings, true, 0),
            2 * SHADOW_CASCADE_COUNT as u32
        );
    }
}
