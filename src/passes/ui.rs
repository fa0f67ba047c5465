//! UI Compositor
//!
//! Text, lines, rectangles and images are queued between frames and drawn
//! over the tone-mapped output on the next update. Primitives are kept in
//! three FIFO queues (text, shapes, images) plus one tag queue recording the
//! submission order across all four kinds. Draining follows the tag queue, so
//! the recorded order equals the submission order, and every primitive is
//! consumed exactly once.
//!
//! Positions are in pixels with the origin at the top-left corner of the
//! output; they are converted to clip space while the frame is prepared.

use std::collections::VecDeque;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};

use crate::assets::{Font, SamplerFilter, SourceId};
use crate::errors::{RenderError, Result};
use crate::frame::DirtyFlags;
use crate::gpu::{
    BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle, BindingResource,
    BindingTableHandle, BindingWrite, ColorAttachment, ColorTargetDesc, CommandRecorder, Extent,
    GpuDevice, ImageHandle, LoadOp, PipelineDesc, PipelineHandle, PushConstants, RenderingInfo,
    SamplerDesc, SamplerHandle, ShaderCompiler, ShaderModuleHandle, Uploader, VertexLayout,
};
use crate::passes::{FrameContext, RenderNode};
use crate::resources::{ImageId, TextureRegistry};
use crate::settings::RendererSettings;

/// One laid-out glyph in the per-slot UI text buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct GpuGlyph {
    pub top_left: [f32; 2],
    pub bottom_right: [f32; 2],
    pub uv_min: [f32; 2],
    pub uv_max: [f32; 2],
}

pub const GPU_GLYPH_SIZE: u64 = std::mem::size_of::<GpuGlyph>() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FontId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiPrimitiveKind {
    Text,
    Line,
    Rectangle,
    Image,
}

impl UiPrimitiveKind {
    /// Debug marker recorded ahead of the primitive's draw.
    #[must_use]
    pub fn marker(self) -> &'static str {
        match self {
            Self::Text => "UI Text",
            Self::Line => "UI Line",
            Self::Rectangle => "UI Rectangle",
            Self::Image => "UI Image",
        }
    }
}

// ============================================================================
// Queues
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct TextCall {
    font: FontId,
    text: String,
    position: Vec2,
    color: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ShapeCall {
    Line { a: Vec2, b: Vec2, color: Vec4 },
    Rectangle { position: Vec2, size: Vec2, color: Vec4 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ImageCall {
    /// Index into the UI texture list.
    texture: u32,
    /// Pixel size of the source image.
    size: Vec2,
    position: Vec2,
    rotation: f32,
    scale: Vec2,
    color: Vec4,
}

#[derive(Debug, Clone, PartialEq)]
enum UiPrimitive {
    Text(TextCall),
    Shape(ShapeCall),
    Image(ImageCall),
}

#[derive(Debug, Default)]
struct UiQueues {
    text: VecDeque<TextCall>,
    shapes: VecDeque<ShapeCall>,
    images: VecDeque<ImageCall>,
    order: VecDeque<UiPrimitiveKind>,
}

impl UiQueues {
    fn push_text(&mut self, call: TextCall) {
        self.text.push_back(call);
        self.order.push_back(UiPrimitiveKind::Text);
    }

    fn push_shape(&mut self, call: ShapeCall) {
        let kind = match call {
            ShapeCall::Line { .. } => UiPrimitiveKind::Line,
            ShapeCall::Rectangle { .. } => UiPrimitiveKind::Rectangle,
        };
        self.shapes.push_back(call);
        self.order.push_back(kind);
    }

    fn push_image(&mut self, call: ImageCall) {
        self.images.push_back(call);
        self.order.push_back(UiPrimitiveKind::Image);
    }

    /// Next primitive in submission order.
    fn pop(&mut self) -> Option<UiPrimitive> {
        let kind = self.order.pop_front()?;
        match kind {
            UiPrimitiveKind::Text => self.text.pop_front().map(UiPrimitive::Text),
            UiPrimitiveKind::Line | UiPrimitiveKind::Rectangle => {
                self.shapes.pop_front().map(UiPrimitive::Shape)
            }
            UiPrimitiveKind::Image => self.images.pop_front().map(UiPrimitive::Image),
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty() && self.text.is_empty() && self.shapes.is_empty() && self.images.is_empty()
    }
}

// ============================================================================
// Geometry helpers
// ============================================================================

/// Pixel position (top-left origin, y down) to clip space.
#[must_use]
pub fn pixel_to_ndc(p: Vec2, extent: Extent) -> Vec2 {
    let w = extent.width.max(1) as f32;
    let h = extent.height.max(1) as f32;
    Vec2::new(p.x / w * 2.0 - 1.0, 1.0 - p.y / h * 2.0)
}

/// Pixel corners of an image drawn centered on `position`, in the order
/// top-left, top-right, bottom-right, bottom-left before rotation.
#[must_use]
pub fn image_quad(size: Vec2, position: Vec2, rotation: f32, scale: Vec2) -> [Vec2; 4] {
    let half = size * scale.abs() * 0.5;
    let (sin, cos) = rotation.sin_cos();
    [
        Vec2::new(-half.x, -half.y),
        Vec2::new(half.x, -half.y),
        Vec2::new(half.x, half.y),
        Vec2::new(-half.x, half.y),
    ]
    .map(|c| position + Vec2::new(c.x * cos - c.y * sin, c.x * sin + c.y * cos))
}

/// Lays a string out glyph by glyph. Returns the glyph quads in pixels.
#[must_use]
pub fn layout_text(font: &Font, text: &str, position: Vec2) -> Vec<GpuGlyph> {
    let mut pen = position;
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' {
            pen = Vec2::new(position.x, pen.y + font.line_height);
            continue;
        }
        let Some(glyph) = font.glyph(c) else {
            debug!("Font has no glyph for {c:?}; skipped");
            continue;
        };
        let top_left = pen + glyph.offset;
        let bottom_right = top_left + glyph.size;
        out.push(GpuGlyph {
            top_left: top_left.to_array(),
            bottom_right: bottom_right.to_array(),
            uv_min: glyph.uv_min.to_array(),
            uv_max: glyph.uv_max.to_array(),
        });
        pen.x += glyph.advance;
    }
    out
}

fn quad_constants(texture: u32, mirror: (bool, bool), corners: [Vec2; 4], color: Vec4) -> PushConstants {
    let mut floats = [0.0f32; 12];
    for (i, c) in corners.iter().enumerate() {
        floats[i * 2] = c.x;
        floats[i * 2 + 1] = c.y;
    }
    floats[8..].copy_from_slice(&color.to_array());
    PushConstants::from_mixed(
        &[texture, u32::from(mirror.0), u32::from(mirror.1), 0],
        &floats,
    )
}

// ============================================================================
// Compositor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum UiDraw {
    Text {
        font: u32,
        first_glyph: u32,
        glyph_count: u32,
        color: Vec4,
    },
    Line {
        a: Vec2,
        b: Vec2,
        color: Vec4,
    },
    Quad {
        kind: UiPrimitiveKind,
        constants: PushConstants,
    },
}

struct LoadedFont {
    font: Arc<Font>,
    atlas: ImageHandle,
}

struct UiTexture {
    image: ImageHandle,
    sampler: SamplerHandle,
}

#[derive(Default)]
struct UiPipelines {
    text: Option<PipelineHandle>,
    line: Option<PipelineHandle>,
    rectangle: Option<PipelineHandle>,
    image: Option<PipelineHandle>,
}

impl UiPipelines {
    fn all(&self) -> impl Iterator<Item = PipelineHandle> {
        [self.text, self.line, self.rectangle, self.image].into_iter().flatten()
    }
}

pub struct UiCompositor {
    text_layout: BindingLayoutHandle,
    image_layout: BindingLayoutHandle,
    shader: Option<ShaderModuleHandle>,
    pipelines: UiPipelines,
    atlas_sampler: SamplerHandle,
    text_tables: Vec<BindingTableHandle>,
    image_tables: Vec<BindingTableHandle>,

    fonts: Vec<LoadedFont>,
    font_lookup: FxHashMap<SourceId, FontId>,
    textures: Vec<UiTexture>,
    texture_lookup: FxHashMap<(ImageId, SamplerFilter), u32>,
    /// Bound in empty font and texture arrays.
    fallback: (ImageHandle, SamplerHandle),

    queues: UiQueues,
    /// Primitives drained for the frame being recorded. Text that produced
    /// no glyphs keeps its entry without a draw.
    batch: Vec<(UiPrimitiveKind, Option<UiDraw>)>,

    max_fonts: u32,
    max_glyphs: u32,
    max_textures: u32,
}

fn blend_target(format: wgpu::TextureFormat) -> [ColorTargetDesc; 1] {
    [ColorTargetDesc {
        format,
        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
    }]
}

impl UiCompositor {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        compiler: &ShaderCompiler,
        settings: &RendererSettings,
        fallback: (ImageHandle, SamplerHandle),
        frames_in_flight: usize,
    ) -> Result<Self> {
        let text_layout = device.create_binding_layout(&BindingLayoutDesc {
            label: "UI Text Layout",
            entries: &[
                BindingLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    kind: BindingKind::Storage { read_only: true },
                },
                BindingLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Texture {
                        dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        count: settings.max_fonts,
                    },
                },
                BindingLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Sampler {
                        comparison: false,
                        count: 1,
                    },
                },
            ],
        })?;
        let image_layout = device.create_binding_layout(&BindingLayoutDesc {
            label: "UI Image Layout",
            entries: &[
                BindingLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Texture {
                        dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        count: settings.max_ui_textures,
                    },
                },
                BindingLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    kind: BindingKind::Sampler {
                        comparison: false,
                        count: settings.max_ui_textures,
                    },
                },
            ],
        })?;

        let shader = compiler.compile(
            device,
            "ui",
            &["vs_text", "fs_text", "vs_line", "vs_image", "fs_color", "fs_image"],
        );
        let mut pipelines = UiPipelines::default();
        if let Some(shader) = shader {
            let targets = blend_target(settings.output_format);
            let mut build = |label: &str,
                             vertex: &str,
                             fragment: &str,
                             layouts: &[BindingLayoutHandle],
                             topology: wgpu::PrimitiveTopology| {
                device.create_pipeline(&PipelineDesc {
                    label,
                    shader,
                    vertex_entry: vertex,
                    fragment_entry: Some(fragment),
                    vertex_layout: VertexLayout::None,
                    binding_layouts: layouts,
                    uses_constants: true,
                    color_targets: &targets,
                    depth: None,
                    topology,
                    cull_mode: None,
                })
            };
            let triangles = wgpu::PrimitiveTopology::TriangleList;
            pipelines.text = Some(build(
                "UI Text Pipeline",
                "vs_text",
                "fs_text",
                &[text_layout],
                triangles,
            )?);
            pipelines.line = Some(build(
                "UI Line Pipeline",
                "vs_line",
                "fs_color",
                &[],
                wgpu::PrimitiveTopology::LineList,
            )?);
            pipelines.rectangle = Some(build(
                "UI Rectangle Pipeline",
                "vs_image",
                "fs_color",
                &[image_layout],
                triangles,
            )?);
            pipelines.image = Some(build(
                "UI Image Pipeline",
                "vs_image",
                "fs_image",
                &[image_layout],
                triangles,
            )?);
        } else {
            warn!("UI shader unavailable; UI primitives will be consumed without drawing");
        }

        let atlas_sampler = device.create_sampler(&SamplerDesc {
            address_mode: [wgpu::AddressMode::ClampToEdge; 3],
            ..Default::default()
        })?;
        let text_tables = (0..frames_in_flight)
            .map(|_| device.create_binding_table("UI Text Bindings", text_layout))
            .collect::<Result<Vec<_>>>()?;
        let image_tables = (0..frames_in_flight)
            .map(|_| device.create_binding_table("UI Image Bindings", image_layout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            text_layout,
            image_layout,
            shader,
            pipelines,
            atlas_sampler,
            text_tables,
            image_tables,
            fonts: Vec::new(),
            font_lookup: FxHashMap::default(),
            textures: Vec::new(),
            texture_lookup: FxHashMap::default(),
            fallback,
            queues: UiQueues::default(),
            batch: Vec::new(),
            max_fonts: settings.max_fonts,
            max_glyphs: settings.max_ui_glyphs,
            max_textures: settings.max_ui_textures,
        })
    }

    /// Uploads a font's atlas (no mips). Returns the id and whether the font
    /// was new, in which case the text binding tables need a rewrite.
    pub fn load_font<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        uploader: &mut Uploader,
        textures: &mut TextureRegistry,
        font: &Arc<Font>,
    ) -> Result<(FontId, bool)> {
        let source = SourceId::of(font);
        if let Some(&id) = self.font_lookup.get(&source) {
            return Ok((id, false));
        }
        if self.fonts.len() as u32 >= self.max_fonts {
            return Err(RenderError::CapacityExceeded {
                resource: "fonts",
                capacity: self.max_fonts as usize,
            });
        }
        let image = textures.load_image(device, uploader, &font.atlas, false)?;
        let atlas = textures
            .get(image)
            .map(|loaded| loaded.image)
            .ok_or(RenderError::UnknownResource {
                kind: "image",
                index: image.0,
            })?;
        let id = FontId(self.fonts.len() as u32);
        self.fonts.push(LoadedFont {
            font: font.clone(),
            atlas,
        });
        self.font_lookup.insert(source, id);
        debug!("Loaded font {id:?} ({} glyphs)", font.glyphs.len());
        Ok((id, true))
    }

    pub fn queue_text(&mut self, font: FontId, text: &str, position: Vec2, color: Vec4) -> Result<()> {
        if font.0 as usize >= self.fonts.len() {
            return Err(RenderError::UnknownResource {
                kind: "font",
                index: font.0,
            });
        }
        self.queues.push_text(TextCall {
            font,
            text: text.to_string(),
            position,
            color,
        });
        Ok(())
    }

    pub fn queue_line(&mut self, a: Vec2, b: Vec2, color: Vec4) {
        self.queues.push_shape(ShapeCall::Line { a, b, color });
    }

    pub fn queue_rectangle(&mut self, position: Vec2, size: Vec2, color: Vec4) {
        self.queues.push_shape(ShapeCall::Rectangle {
            position,
            size,
            color,
        });
    }

    /// Queues an image centered on `position`. Returns `true` when the
    /// `(image, filter)` pair was new to the UI texture list, in which case
    /// the image binding tables need a rewrite.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_image<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        textures: &mut TextureRegistry,
        image: ImageId,
        filter: SamplerFilter,
        position: Vec2,
        rotation: f32,
        scale: Vec2,
        color: Vec4,
    ) -> Result<bool> {
        let loaded = *textures.get(image).ok_or(RenderError::UnknownResource {
            kind: "image",
            index: image.0,
        })?;
        let (texture, grew) = match self.texture_lookup.get(&(image, filter)) {
            Some(&index) => (index, false),
            None => {
                if self.textures.len() as u32 >= self.max_textures {
                    return Err(RenderError::CapacityExceeded {
                        resource: "ui textures",
                        capacity: self.max_textures as usize,
                    });
                }
                let key = textures.sampler(device, &filter.sampler_desc())?;
                let sampler = textures.sampler_handle(&key).ok_or_else(|| {
                    RenderError::InvalidAsset(format!("sampler '{key}' was never created"))
                })?;
                let index = self.textures.len() as u32;
                self.textures.push(UiTexture {
                    image: loaded.image,
                    sampler,
                });
                self.texture_lookup.insert((image, filter), index);
                (index, true)
            }
        };
        self.queues.push_image(ImageCall {
            texture,
            size: Vec2::new(loaded.width as f32, loaded.height as f32),
            position,
            rotation,
            scale,
            color,
        });
        Ok(grew)
    }

    /// Primitives waiting for the next frame.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queues.is_empty()
    }

    /// Kinds drained by the last prepared frame, in draw order.
    #[must_use]
    pub fn last_drawn(&self) -> Vec<UiPrimitiveKind> {
        self.batch.iter().map(|(kind, _)| *kind).collect()
    }

    #[must_use]
    pub fn font_count(&self) -> usize {
        self.fonts.len()
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn write_text_table(&self, device: &mut dyn GpuDevice, frame: &FrameContext<'_>) -> Result<()> {
        let mut atlases: SmallVec<[ImageHandle; 4]> = self.fonts.iter().map(|f| f.atlas).collect();
        if atlases.is_empty() {
            atlases.push(self.fallback.0);
        }
        device.write_binding_table(
            self.text_tables[frame.slot],
            &[
                BindingWrite {
                    binding: 0,
                    resource: BindingResource::Buffer(frame.buffers.ui_text),
                },
                BindingWrite {
                    binding: 1,
                    resource: BindingResource::Textures(atlases),
                },
                BindingWrite {
                    binding: 2,
                    resource: BindingResource::Samplers(smallvec![self.atlas_sampler]),
                },
            ],
        )
    }

    fn write_image_table(&self, device: &mut dyn GpuDevice, frame: &FrameContext<'_>) -> Result<()> {
        let (mut images, mut samplers): (SmallVec<[ImageHandle; 4]>, SmallVec<[SamplerHandle; 4]>) =
            self.textures.iter().map(|t| (t.image, t.sampler)).unzip();
        if images.is_empty() {
            images.push(self.fallback.0);
            samplers.push(self.fallback.1);
        }
        device.write_binding_table(
            self.image_tables[frame.slot],
            &[
                BindingWrite {
                    binding: 3,
                    resource: BindingResource::Textures(images),
                },
                BindingWrite {
                    binding: 4,
                    resource: BindingResource::Samplers(samplers),
                },
            ],
        )
    }

    /// Drains the queues into draws and glyph records.
    fn build_batch(&mut self, extent: Extent) -> Vec<GpuGlyph> {
        self.batch.clear();
        let mut glyphs: Vec<GpuGlyph> = Vec::new();
        while let Some(primitive) = self.queues.pop() {
            let entry = match primitive {
                UiPrimitive::Text(call) => {
                    let draw = self.fonts.get(call.font.0 as usize).and_then(|font| {
                        let mut laid = layout_text(&font.font, &call.text, call.position);
                        let room = (self.max_glyphs as usize).saturating_sub(glyphs.len());
                        if laid.len() > room {
                            warn!(
                                "UI glyph buffer full ({}); truncating text {:?}",
                                self.max_glyphs, call.text
                            );
                            laid.truncate(room);
                        }
                        if laid.is_empty() {
                            warn!("UI text {:?} produced no glyphs", call.text);
                            return None;
                        }
                        for g in &mut laid {
                            g.top_left = pixel_to_ndc(Vec2::from(g.top_left), extent).to_array();
                            g.bottom_right =
                                pixel_to_ndc(Vec2::from(g.bottom_right), extent).to_array();
                        }
                        let first_glyph = glyphs.len() as u32;
                        let glyph_count = laid.len() as u32;
                        glyphs.extend(laid);
                        Some(UiDraw::Text {
                            font: call.font.0,
                            first_glyph,
                            glyph_count,
                            color: call.color,
                        })
                    });
                    (UiPrimitiveKind::Text, draw)
                }
                UiPrimitive::Shape(ShapeCall::Line { a, b, color }) => (
                    UiPrimitiveKind::Line,
                    Some(UiDraw::Line {
                        a: pixel_to_ndc(a, extent),
                        b: pixel_to_ndc(b, extent),
                        color,
                    }),
                ),
                UiPrimitive::Shape(ShapeCall::Rectangle {
                    position,
                    size,
                    color,
                }) => {
                    let corners = [
                        position,
                        position + Vec2::new(size.x, 0.0),
                        position + size,
                        position + Vec2::new(0.0, size.y),
                    ]
                    .map(|c| pixel_to_ndc(c, extent));
                    (
                        UiPrimitiveKind::Rectangle,
                        Some(UiDraw::Quad {
                            kind: UiPrimitiveKind::Rectangle,
                            constants: quad_constants(0, (false, false), corners, color),
                        }),
                    )
                }
                UiPrimitive::Image(call) => {
                    let corners = image_quad(call.size, call.position, call.rotation, call.scale)
                        .map(|c| pixel_to_ndc(c, extent));
                    let mirror = (call.scale.x < 0.0, call.scale.y < 0.0);
                    (
                        UiPrimitiveKind::Image,
                        Some(UiDraw::Quad {
                            kind: UiPrimitiveKind::Image,
                            constants: quad_constants(call.texture, mirror, corners, call.color),
                        }),
                    )
                }
            };
            self.batch.push(entry);
        }
        glyphs
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for table in self.text_tables.into_iter().chain(self.image_tables) {
            device.destroy_binding_table(table)?;
        }
        for pipeline in self.pipelines.all() {
            device.destroy_pipeline(pipeline)?;
        }
        if let Some(shader) = self.shader {
            device.destroy_shader(shader)?;
        }
        device.destroy_sampler(self.atlas_sampler)?;
        device.destroy_binding_layout(self.text_layout)?;
        device.destroy_binding_layout(self.image_layout)
    }
}

impl RenderNode for UiCompositor {
    fn name(&self) -> &'static str {
        "UI Pass"
    }

    fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FrameContext<'_>,
        dirty: &mut DirtyFlags,
    ) -> Result<()> {
        if dirty.contains(DirtyFlags::UI_TEXT_BINDINGS) {
            self.write_text_table(device, frame)?;
            dirty.remove(DirtyFlags::UI_TEXT_BINDINGS);
        }
        if dirty.contains(DirtyFlags::UI_IMAGE_BINDINGS) {
            self.write_image_table(device, frame)?;
            dirty.remove(DirtyFlags::UI_IMAGE_BINDINGS);
        }
        let glyphs = self.build_batch(frame.output_extent);
        if !glyphs.is_empty() {
            device.write_buffer(frame.buffers.ui_text, 0, bytemuck::cast_slice(&glyphs))?;
        }
        Ok(())
    }

    fn run(&self, frame: &FrameContext<'_>, recorder: &mut CommandRecorder) {
        if self.batch.is_empty() {
            return;
        }
        recorder.begin_rendering(RenderingInfo {
            label: "UI Pass",
            color: smallvec![ColorAttachment {
                image: frame.output,
                layer: 0,
                load: LoadOp::Load,
                store: true,
            }],
            depth: None,
            extent: frame.output_extent,
        });
        for (kind, draw) in &self.batch {
            recorder.marker(kind.marker());
            let Some(draw) = draw else { continue };
            match *draw {
                UiDraw::Text {
                    font,
                    first_glyph,
                    glyph_count,
                    color,
                } => {
                    if let Some(pipeline) = self.pipelines.text {
                        recorder.set_pipeline(pipeline);
                        recorder.set_binding_table(0, self.text_tables[frame.slot]);
                        recorder.set_constants(PushConstants::from_mixed(
                            &[font, first_glyph, 0, 0],
                            &color.to_array(),
                        ));
                        recorder.draw(glyph_count * 6);
                    }
                }
                UiDraw::Line { a, b, color } => {
                    if let Some(pipeline) = self.pipelines.line {
                        recorder.set_pipeline(pipeline);
                        let c = color.to_array();
                        recorder.set_constants(PushConstants::from_mixed(
                            &[],
                            &[a.x, a.y, b.x, b.y, c[0], c[1], c[2], c[3]],
                        ));
                        recorder.draw(2);
                    }
                }
                UiDraw::Quad { kind, constants } => {
                    let pipeline = if kind == UiPrimitiveKind::Image {
                        self.pipelines.image
                    } else {
                        self.pipelines.rectangle
                    };
                    if let Some(pipeline) = pipeline {
                        recorder.set_pipeline(pipeline);
                        recorder.set_binding_table(0, self.image_tables[frame.slot]);
                        recorder.set_constants(constants);
                        recorder.draw(6);
                    }
                }
            }
        }
        recorder.end_rendering();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{Glyph, Image, ImageFormat};

    const EPSILON: f32 = 1e-5;

    fn approx(a: Vec2, b: Vec2) -> bool {
        (a - b).abs().max_element() < EPSILON
    }

    fn font() -> Font {
        let mut glyphs = FxHashMap::default();
        glyphs.insert(
            'a',
            Glyph {
                offset: Vec2::new(0.0, 2.0),
                size: Vec2::new(8.0, 10.0),
                advance: 9.0,
                uv_min: Vec2::ZERO,
                uv_max: Vec2::splat(0.5),
            },
        );
        let atlas = Arc::new(Image::new(1, 1, ImageFormat::R8, vec![255]));
        Font::new(atlas, glyphs, 16.0)
    }

    #[test]
    fn queues_drain_in_submission_order() {
        let mut q = UiQueues::default();
        q.push_shape(ShapeCall::Rectangle {
            position: Vec2::ZERO,
            size: Vec2::ONE,
            color: Vec4::ONE,
        });
        q.push_text(TextCall {
            font: FontId(0),
            text: "a".into(),
            position: Vec2::ZERO,
            color: Vec4::ONE,
        });
        q.push_shape(ShapeCall::Line {
            a: Vec2::ZERO,
            b: Vec2::ONE,
            color: Vec4::ONE,
        });
        assert_eq!(q.len(), 3);
        assert!(matches!(q.pop(), Some(UiPrimitive::Shape(ShapeCall::Rectangle { .. }))));
        assert!(matches!(q.pop(), Some(UiPrimitive::Text(_))));
        assert!(matches!(q.pop(), Some(UiPrimitive::Shape(ShapeCall::Line { .. }))));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn text_layout_advances_pen_and_skips_unknown() {
        let glyphs = layout_text(&font(), "a?a\na", Vec2::new(10.0, 20.0));
        assert_eq!(glyphs.len(), 3, "unknown glyph must be skipped");
        assert_eq!(glyphs[0].top_left, [10.0, 22.0]);
        assert_eq!(glyphs[1].top_left, [19.0, 22.0]);
        assert_eq!(glyphs[2].top_left, [10.0, 38.0], "newline resets x, adds line height");
        assert_eq!(glyphs[0].bottom_right, [18.0, 32.0]);
    }

    #[test]
    fn pixel_corners_map_to_clip_corners() {
        let extent = Extent::new(200, 100);
        assert!(approx(pixel_to_ndc(Vec2::ZERO, extent), Vec2::new(-1.0, 1.0)));
        assert!(approx(pixel_to_ndc(Vec2::new(200.0, 100.0), extent), Vec2::new(1.0, -1.0)));
        assert!(approx(pixel_to_ndc(Vec2::new(100.0, 50.0), extent), Vec2::ZERO));
    }

    #[test]
    fn image_quad_rotates_around_center() {
        let quad = image_quad(
            Vec2::new(4.0, 2.0),
            Vec2::new(10.0, 10.0),
            std::f32::consts::FRAC_PI_2,
            Vec2::new(-1.0, 1.0),
        );
        // half extent (2, 1) rotated by 90°: (-2, -1) -> (1, -2)
        assert!(approx(quad[0], Vec2::new(11.0, 8.0)));
        let center = quad.iter().copied().sum::<Vec2>() / 4.0;
        assert!(approx(center, Vec2::new(10.0, 10.0)));
    }

    #[test]
    fn quad_constants_pack_mirror_and_color() {
        let c = quad_constants(3, (true, false), [Vec2::ONE; 4], Vec4::new(0.1, 0.2, 0.3, 0.4));
        assert_eq!(c.word(0), 3);
        assert_eq!(c.word(1), 1);
        assert_eq!(c.word(2), 0);
        assert!((c.float(15) - 0.4).abs() < EPSILON);
    }
}
