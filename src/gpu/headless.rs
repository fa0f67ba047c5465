//! In-memory device.
//!
//! [`HeadlessDevice`] executes command lists synchronously on the host. It
//! keeps real bytes for buffers, tracks the layout of every image
//! subresource, and rejects command streams that break the barrier protocol:
//!
//! - a barrier whose `from` layout (other than `Undefined`) does not match
//! - an attachment not in its attachment layout when rendering begins
//! - a sampled texture not in `ShaderReadOnly` when a draw consumes it
//! - copies and blits outside `TransferSrc` / `TransferDst`
//!
//! Fences signal at submit. Tests can inspect the submission log and force
//! the output chain out of date to exercise the resize path.

use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use super::command::{Command, CommandList};
use super::device::{GpuDevice, ShaderSource, SubmitInfo};
use super::types::{
    AcquireOutcome, BindingKind, BindingLayoutDesc, BindingLayoutEntry, BindingLayoutHandle,
    BindingResource, BindingTableHandle, BindingWrite, BufferDesc, BufferHandle, DeviceInfo,
    Extent, FenceHandle, ImageBarrier, ImageDesc, ImageHandle, ImageLayout, OutputChain,
    OutputChainDesc, OutputChainHandle, PipelineDesc, PipelineHandle, PresentOutcome, SamplerDesc,
    SamplerHandle, SemaphoreHandle, ShaderModuleHandle,
};
use crate::errors::{DeviceErrorCode, RenderError, Result};

struct HeadlessBuffer {
    label: String,
    data: Vec<u8>,
    host_visible: bool,
}

struct HeadlessImage {
    label: String,
    width: u32,
    height: u32,
    layers: u32,
    mip_levels: u32,
    format: wgpu::TextureFormat,
    /// `layer * mip_levels + mip`
    layouts: Vec<ImageLayout>,
    written: Vec<bool>,
    chain_owned: bool,
}

impl HeadlessImage {
    fn slot(&self, layer: u32, mip: u32) -> usize {
        (layer * self.mip_levels + mip) as usize
    }
}

struct HeadlessTable {
    layout: BindingLayoutHandle,
    bindings: FxHashMap<u32, BindingResource>,
}

struct HeadlessPipeline {
    label: String,
}

struct HeadlessChain {
    images: Vec<ImageHandle>,
    next: u32,
    stale: bool,
}

/// One executed submission, kept for inspection.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub commands: CommandList,
    pub waits: usize,
    pub signals: usize,
    pub fenced: bool,
}

#[derive(Default)]
struct ExecState {
    rendering: bool,
    pipeline: Option<PipelineHandle>,
    index_buffer: Option<BufferHandle>,
    tables: FxHashMap<u32, BindingTableHandle>,
    unchecked_tables: Vec<u32>,
}

pub struct HeadlessDevice {
    info: DeviceInfo,
    buffers: SlotMap<BufferHandle, HeadlessBuffer>,
    images: SlotMap<ImageHandle, HeadlessImage>,
    samplers: SlotMap<SamplerHandle, SamplerDesc>,
    binding_layouts: SlotMap<BindingLayoutHandle, Vec<BindingLayoutEntry>>,
    binding_tables: SlotMap<BindingTableHandle, HeadlessTable>,
    shaders: SlotMap<ShaderModuleHandle, Vec<String>>,
    pipelines: SlotMap<PipelineHandle, HeadlessPipeline>,
    fences: SlotMap<FenceHandle, bool>,
    semaphores: SlotMap<SemaphoreHandle, bool>,
    chains: SlotMap<OutputChainHandle, HeadlessChain>,
    submissions: Vec<SubmissionRecord>,
    presented: u64,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(kind: &str) -> RenderError {
    RenderError::device(
        DeviceErrorCode::InvalidHandle,
        format!("{kind} handle is stale or unknown"),
    )
}

fn layout_error(context: String) -> RenderError {
    RenderError::device(DeviceErrorCode::InvalidLayout, context)
}

impl HeadlessDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                name: "Headless".to_string(),
                clip_y_down: true,
                supports_depth_clamp: true,
            },
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            binding_layouts: SlotMap::with_key(),
            binding_tables: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            semaphores: SlotMap::with_key(),
            chains: SlotMap::with_key(),
            submissions: Vec::new(),
            presented: 0,
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of device objects not yet destroyed.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.binding_layouts.len()
            + self.binding_tables.len()
            + self.shaders.len()
            + self.pipelines.len()
            + self.fences.len()
            + self.semaphores.len()
            + self.chains.len()
    }

    #[must_use]
    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn image_exists(&self, image: ImageHandle) -> bool {
        self.images.contains_key(image)
    }

    #[must_use]
    pub fn buffer_exists(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(buffer)
    }

    #[must_use]
    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(buffer).map(|b| b.data.len() as u64)
    }

    #[must_use]
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    /// `(width, height, layers, mip_levels)` of a live image.
    #[must_use]
    pub fn image_shape(&self, image: ImageHandle) -> Option<(u32, u32, u32, u32)> {
        self.images
            .get(image)
            .map(|i| (i.width, i.height, i.layers, i.mip_levels))
    }

    #[must_use]
    pub fn image_label(&self, image: ImageHandle) -> Option<&str> {
        self.images.get(image).map(|i| i.label.as_str())
    }

    #[must_use]
    pub fn image_layout(&self, image: ImageHandle, layer: u32, mip: u32) -> Option<ImageLayout> {
        let img = self.images.get(image)?;
        img.layouts.get(img.slot(layer, mip)).copied()
    }

    /// Whether a subresource has been written by a copy, blit or attachment.
    #[must_use]
    pub fn mip_written(&self, image: ImageHandle, layer: u32, mip: u32) -> bool {
        self.images
            .get(image)
            .and_then(|img| img.written.get(img.slot(layer, mip)).copied())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn binding(&self, table: BindingTableHandle, binding: u32) -> Option<&BindingResource> {
        self.binding_tables.get(table)?.bindings.get(&binding)
    }

    #[must_use]
    pub fn pipeline_label(&self, pipeline: PipelineHandle) -> Option<&str> {
        self.pipelines.get(pipeline).map(|p| p.label.as_str())
    }

    #[must_use]
    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    pub fn clear_submissions(&mut self) {
        self.submissions.clear();
    }

    #[must_use]
    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    /// Makes every output chain report out-of-date on its next acquire.
    pub fn mark_output_stale(&mut self) {
        for chain in self.chains.values_mut() {
            chain.stale = true;
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn apply_barrier(&mut self, barrier: &ImageBarrier) -> Result<()> {
        let img = self.images.get_mut(barrier.image).ok_or_else(|| invalid("image"))?;
        if barrier.base_layer + barrier.layer_count > img.layers
            || barrier.base_mip + barrier.mip_count > img.mip_levels
        {
            return Err(layout_error(format!(
                "barrier range out of bounds for '{}'",
                img.label
            )));
        }
        for layer in barrier.base_layer..barrier.base_layer + barrier.layer_count {
            for mip in barrier.base_mip..barrier.base_mip + barrier.mip_count {
                let slot = img.slot(layer, mip);
                let current = img.layouts[slot];
                if barrier.from != ImageLayout::Undefined && current != barrier.from {
                    return Err(layout_error(format!(
                        "'{}' layer {layer} mip {mip}: barrier expects {:?}, image is {:?}",
                        img.label, barrier.from, current
                    )));
                }
                img.layouts[slot] = barrier.to;
            }
        }
        trace!(
            "barrier '{}' {:?} -> {:?}",
            img.label, barrier.from, barrier.to
        );
        Ok(())
    }

    fn expect_layout(
        &self,
        image: ImageHandle,
        layer: u32,
        mip: u32,
        expected: ImageLayout,
    ) -> Result<()> {
        let img = self.images.get(image).ok_or_else(|| invalid("image"))?;
        if layer >= img.layers || mip >= img.mip_levels {
            return Err(layout_error(format!(
                "'{}' has no layer {layer} mip {mip}",
                img.label
            )));
        }
        let current = img.layouts[img.slot(layer, mip)];
        if current != expected {
            return Err(layout_error(format!(
                "'{}' layer {layer} mip {mip} is {current:?}, expected {expected:?}",
                img.label
            )));
        }
        Ok(())
    }

    fn mark_written(&mut self, image: ImageHandle, layer: u32, mip: u32) {
        if let Some(img) = self.images.get_mut(image) {
            let slot = img.slot(layer, mip);
            img.written[slot] = true;
        }
    }

    fn validate_sampled(&self, table: BindingTableHandle) -> Result<()> {
        let table = self
            .binding_tables
            .get(table)
            .ok_or_else(|| invalid("binding table"))?;
        for resource in table.bindings.values() {
            if let BindingResource::Textures(images) = resource {
                for &image in images {
                    let img = self.images.get(image).ok_or_else(|| invalid("image"))?;
                    for layer in 0..img.layers {
                        for mip in 0..img.mip_levels {
                            self.expect_layout(image, layer, mip, ImageLayout::ShaderReadOnly)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn before_draw(&mut self, state: &mut ExecState) -> Result<()> {
        if !state.rendering {
            return Err(RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                "draw outside a rendering scope",
            ));
        }
        if state.pipeline.is_none() {
            return Err(RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                "draw without a pipeline",
            ));
        }
        for index in std::mem::take(&mut state.unchecked_tables) {
            if let Some(&table) = state.tables.get(&index) {
                self.validate_sampled(table)?;
            }
        }
        Ok(())
    }

    fn execute(&mut self, list: &CommandList) -> Result<()> {
        let mut state = ExecState::default();
        for command in &list.commands {
            match command {
                Command::Barrier(barrier) => self.apply_barrier(barrier)?,
                Command::BeginRendering(info) => {
                    for color in &info.color {
                        self.expect_layout(
                            color.image,
                            color.layer,
                            0,
                            ImageLayout::ColorAttachment,
                        )?;
                        self.mark_written(color.image, color.layer, 0);
                    }
                    if let Some(depth) = &info.depth {
                        self.expect_layout(
                            depth.image,
                            depth.layer,
                            0,
                            ImageLayout::DepthAttachment,
                        )?;
                        self.mark_written(depth.image, depth.layer, 0);
                    }
                    state.rendering = true;
                    state.unchecked_tables = state.tables.keys().copied().collect();
                }
                Command::EndRendering => {
                    state.rendering = false;
                }
                Command::SetPipeline(pipeline) => {
                    if !self.pipelines.contains_key(*pipeline) {
                        return Err(invalid("pipeline"));
                    }
                    state.pipeline = Some(*pipeline);
                }
                Command::SetBindingTable { index, table } => {
                    if !self.binding_tables.contains_key(*table) {
                        return Err(invalid("binding table"));
                    }
                    state.tables.insert(*index, *table);
                    state.unchecked_tables.push(*index);
                }
                Command::SetConstants(_) | Command::DebugMarker(_) => {}
                Command::SetVertexBuffer(buffer) => {
                    if !self.buffers.contains_key(*buffer) {
                        return Err(invalid("buffer"));
                    }
                }
                Command::SetIndexBuffer(buffer) => {
                    if !self.buffers.contains_key(*buffer) {
                        return Err(invalid("buffer"));
                    }
                    state.index_buffer = Some(*buffer);
                }
                Command::Draw { .. } => self.before_draw(&mut state)?,
                Command::DrawIndexed {
                    index_count,
                    first_index,
                    ..
                } => {
                    self.before_draw(&mut state)?;
                    let buffer = state.index_buffer.ok_or_else(|| {
                        RenderError::device(
                            DeviceErrorCode::SubmissionFailed,
                            "indexed draw without an index buffer",
                        )
                    })?;
                    let size = self.buffers.get(buffer).map_or(0, |b| b.data.len() as u64);
                    let end = u64::from(first_index + index_count) * 4;
                    if end > size {
                        return Err(RenderError::device(
                            DeviceErrorCode::SubmissionFailed,
                            format!("indexed draw reads {end} bytes of a {size} byte index buffer"),
                        ));
                    }
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => self.copy_buffer(*src, *src_offset, *dst, *dst_offset, *size)?,
                Command::CopyBufferToImage {
                    src,
                    src_offset,
                    dst,
                    layer,
                    width,
                    height,
                } => {
                    self.expect_layout(*dst, *layer, 0, ImageLayout::TransferDst)?;
                    let img = self.images.get(*dst).ok_or_else(|| invalid("image"))?;
                    let texel = u64::from(img.format.block_copy_size(None).unwrap_or(4));
                    let bytes = u64::from(*width) * u64::from(*height) * texel;
                    let src_len = self.buffers.get(*src).ok_or_else(|| invalid("buffer"))?.data.len();
                    if src_offset + bytes > src_len as u64 {
                        return Err(RenderError::device(
                            DeviceErrorCode::SubmissionFailed,
                            "image copy reads past the staging buffer",
                        ));
                    }
                    self.mark_written(*dst, *layer, 0);
                }
                Command::BlitMip { image, src_mip } => {
                    let layers = self.images.get(*image).ok_or_else(|| invalid("image"))?.layers;
                    for layer in 0..layers {
                        self.expect_layout(*image, layer, *src_mip, ImageLayout::TransferSrc)?;
                        self.expect_layout(*image, layer, src_mip + 1, ImageLayout::TransferDst)?;
                        self.mark_written(*image, layer, src_mip + 1);
                    }
                }
            }
        }
        if state.rendering {
            return Err(RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                "command list ends inside a rendering scope",
            ));
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src_range = src_offset as usize..(src_offset + size) as usize;
        let dst_range = dst_offset as usize..(dst_offset + size) as usize;
        let out_of_range = || {
            RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                "buffer copy out of range",
            )
        };
        if src == dst {
            let buf = self.buffers.get_mut(src).ok_or_else(|| invalid("buffer"))?;
            if src_range.end > buf.data.len() || dst_range.end > buf.data.len() {
                return Err(out_of_range());
            }
            buf.data.copy_within(src_range, dst_range.start);
            return Ok(());
        }
        let bytes = {
            let buf = self.buffers.get(src).ok_or_else(|| invalid("buffer"))?;
            buf.data.get(src_range).ok_or_else(out_of_range)?.to_vec()
        };
        let buf = self.buffers.get_mut(dst).ok_or_else(|| invalid("buffer"))?;
        buf.data
            .get_mut(dst_range)
            .ok_or_else(out_of_range)?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn validate_write(&self, layout: &[BindingLayoutEntry], write: &BindingWrite) -> Result<()> {
        let entry = layout
            .iter()
            .find(|e| e.binding == write.binding)
            .ok_or_else(|| {
                RenderError::device(
                    DeviceErrorCode::Unknown,
                    format!("binding {} is not declared by the layout", write.binding),
                )
            })?;
        let mismatch = || {
            RenderError::device(
                DeviceErrorCode::Unknown,
                format!("binding {} written with the wrong resource kind", write.binding),
            )
        };
        match (&write.resource, entry.kind) {
            (BindingResource::Buffer(buffer), BindingKind::Uniform | BindingKind::Storage { .. }) => {
                if !self.buffers.contains_key(*buffer) {
                    return Err(invalid("buffer"));
                }
            }
            (BindingResource::Textures(images), BindingKind::Texture { count, .. }) => {
                if images.len() > count as usize {
                    return Err(RenderError::CapacityExceeded {
                        resource: "binding array",
                        capacity: count as usize,
                    });
                }
                if images.iter().any(|i| !self.images.contains_key(*i)) {
                    return Err(invalid("image"));
                }
            }
            (BindingResource::Samplers(samplers), BindingKind::Sampler { count, .. }) => {
                if samplers.len() > count as usize {
                    return Err(RenderError::CapacityExceeded {
                        resource: "sampler array",
                        capacity: count as usize,
                    });
                }
                if samplers.iter().any(|s| !self.samplers.contains_key(*s)) {
                    return Err(invalid("sampler"));
                }
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

fn check_entry_points(source: &ShaderSource<'_>) -> std::result::Result<Vec<String>, String> {
    if source.wgsl.trim().is_empty() {
        return Err("empty source".to_string());
    }
    let mut depth = 0i64;
    for c in source.wgsl.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err("unbalanced braces".to_string());
        }
    }
    if depth != 0 {
        return Err("unbalanced braces".to_string());
    }
    let mut found = Vec::with_capacity(source.entry_points.len());
    for entry in source.entry_points {
        if !source.wgsl.contains(&format!("fn {entry}(")) {
            return Err(format!("entry point '{entry}' not found"));
        }
        found.push((*entry).to_string());
    }
    Ok(found)
}

impl GpuDevice for HeadlessDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("zero-sized buffer '{}'", desc.label),
            ));
        }
        Ok(self.buffers.insert(HeadlessBuffer {
            label: desc.label.to_string(),
            data: vec![0; desc.size as usize],
            host_visible: desc.host_visible,
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffers.remove(buffer).map(|_| ()).ok_or_else(|| invalid("buffer"))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buf = self.buffers.get_mut(buffer).ok_or_else(|| invalid("buffer"))?;
        if !buf.host_visible {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("'{}' is not host visible", buf.label),
            ));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.data.len() {
            return Err(RenderError::device(
                DeviceErrorCode::OutOfMemory,
                format!(
                    "write of {} bytes at {offset} overflows '{}' ({} bytes)",
                    data.len(),
                    buf.label,
                    buf.data.len()
                ),
            ));
        }
        buf.data[start..end].copy_from_slice(data);
        Ok(())
    }

    // ========================================================================
    // Images & samplers
    // ========================================================================

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle> {
        if desc.extent().is_zero_area() || desc.layers == 0 || desc.mip_levels == 0 {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("degenerate image '{}'", desc.label),
            ));
        }
        let count = (desc.layers * desc.mip_levels) as usize;
        Ok(self.images.insert(HeadlessImage {
            label: desc.label.to_string(),
            width: desc.width,
            height: desc.height,
            layers: desc.layers,
            mip_levels: desc.mip_levels,
            format: desc.format,
            layouts: vec![ImageLayout::Undefined; count],
            written: vec![false; count],
            chain_owned: false,
        }))
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        match self.images.get(image) {
            Some(img) if img.chain_owned => Err(RenderError::device(
                DeviceErrorCode::InvalidHandle,
                format!("'{}' belongs to an output chain", img.label),
            )),
            Some(_) => {
                self.images.remove(image);
                Ok(())
            }
            None => Err(invalid("image")),
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        Ok(self.samplers.insert(*desc))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        self.samplers.remove(sampler).map(|_| ()).ok_or_else(|| invalid("sampler"))
    }

    // ========================================================================
    // Binding tables
    // ========================================================================

    fn create_binding_layout(
        &mut self,
        desc: &BindingLayoutDesc<'_>,
    ) -> Result<BindingLayoutHandle> {
        Ok(self.binding_layouts.insert(desc.entries.to_vec()))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) -> Result<()> {
        self.binding_layouts
            .remove(layout)
            .map(|_| ())
            .ok_or_else(|| invalid("binding layout"))
    }

    fn create_binding_table(
        &mut self,
        _label: &str,
        layout: BindingLayoutHandle,
    ) -> Result<BindingTableHandle> {
        if !self.binding_layouts.contains_key(layout) {
            return Err(invalid("binding layout"));
        }
        Ok(self.binding_tables.insert(HeadlessTable {
            layout,
            bindings: FxHashMap::default(),
        }))
    }

    fn write_binding_table(
        &mut self,
        table: BindingTableHandle,
        writes: &[BindingWrite],
    ) -> Result<()> {
        let layout = self
            .binding_tables
            .get(table)
            .ok_or_else(|| invalid("binding table"))?
            .layout;
        let entries = self
            .binding_layouts
            .get(layout)
            .ok_or_else(|| invalid("binding layout"))?;
        for write in writes {
            self.validate_write(entries, write)?;
        }
        let table = self
            .binding_tables
            .get_mut(table)
            .ok_or_else(|| invalid("binding table"))?;
        for write in writes {
            table.bindings.insert(write.binding, write.resource.clone());
        }
        Ok(())
    }

    fn destroy_binding_table(&mut self, table: BindingTableHandle) -> Result<()> {
        self.binding_tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| invalid("binding table"))
    }

    // ========================================================================
    // Shaders & pipelines
    // ========================================================================

    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Option<ShaderModuleHandle> {
        match check_entry_points(source) {
            Ok(entries) => Some(self.shaders.insert(entries)),
            Err(reason) => {
                warn!("Shader '{}' failed to compile: {reason}", source.label);
                None
            }
        }
    }

    fn destroy_shader(&mut self, shader: ShaderModuleHandle) -> Result<()> {
        self.shaders.remove(shader).map(|_| ()).ok_or_else(|| invalid("shader"))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        let entries = self.shaders.get(desc.shader).ok_or_else(|| invalid("shader"))?;
        let has = |name: &str| entries.iter().any(|e| e == name);
        if !has(desc.vertex_entry) || desc.fragment_entry.is_some_and(|f| !has(f)) {
            return Err(RenderError::device(
                DeviceErrorCode::Unknown,
                format!("pipeline '{}' references a missing entry point", desc.label),
            ));
        }
        if desc
            .binding_layouts
            .iter()
            .any(|l| !self.binding_layouts.contains_key(*l))
        {
            return Err(invalid("binding layout"));
        }
        Ok(self.pipelines.insert(HeadlessPipeline {
            label: desc.label.to_string(),
        }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines.remove(pipeline).map(|_| ()).ok_or_else(|| invalid("pipeline"))
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle> {
        Ok(self.fences.insert(signaled))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()> {
        self.fences.remove(fence).map(|_| ()).ok_or_else(|| invalid("fence"))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> Result<()> {
        let signaled = *self.fences.get(fence).ok_or_else(|| invalid("fence"))?;
        if signaled {
            Ok(())
        } else {
            Err(RenderError::device(
                DeviceErrorCode::Unknown,
                "waiting on a fence with no pending submission",
            ))
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()> {
        *self.fences.get_mut(fence).ok_or_else(|| invalid("fence"))? = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceHandle) -> Result<bool> {
        self.fences.get(fence).copied().ok_or_else(|| invalid("fence"))
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle> {
        Ok(self.semaphores.insert(false))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()> {
        self.semaphores
            .remove(semaphore)
            .map(|_| ())
            .ok_or_else(|| invalid("semaphore"))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    fn submit(&mut self, commands: CommandList, info: &SubmitInfo) -> Result<()> {
        if let Some(fence) = info.fence {
            let signaled = *self.fences.get(fence).ok_or_else(|| invalid("fence"))?;
            if signaled {
                return Err(RenderError::device(
                    DeviceErrorCode::SubmissionFailed,
                    format!("'{}' submitted with a fence that was never reset", commands.label),
                ));
            }
        }
        for &wait in &info.waits {
            let sem = self.semaphores.get_mut(wait).ok_or_else(|| invalid("semaphore"))?;
            if !*sem {
                return Err(RenderError::device(
                    DeviceErrorCode::SubmissionFailed,
                    format!("'{}' waits on an unsignalled semaphore", commands.label),
                ));
            }
            *sem = false;
        }

        self.execute(&commands)?;

        for &signal in &info.signals {
            *self.semaphores.get_mut(signal).ok_or_else(|| invalid("semaphore"))? = true;
        }
        if let Some(fence) = info.fence {
            if let Some(f) = self.fences.get_mut(fence) {
                *f = true;
            }
        }
        debug!(
            "Executed '{}' ({} commands)",
            commands.label,
            commands.commands.len()
        );
        self.submissions.push(SubmissionRecord {
            waits: info.waits.len(),
            signals: info.signals.len(),
            fenced: info.fence.is_some(),
            commands,
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }

    // ========================================================================
    // Presentation
    // ========================================================================

    fn create_output_chain(&mut self, desc: &OutputChainDesc) -> Result<OutputChain> {
        if desc.extent.is_zero_area() {
            return Err(RenderError::device(
                DeviceErrorCode::SurfaceLost,
                "output chain with zero area",
            ));
        }
        let count = if desc.vsync { 3 } else { 2 };
        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            let image = self.images.insert(HeadlessImage {
                label: format!("Output Image {i}"),
                width: desc.extent.width,
                height: desc.extent.height,
                layers: 1,
                mip_levels: 1,
                format: desc.format,
                layouts: vec![ImageLayout::Undefined],
                written: vec![false],
                chain_owned: true,
            });
            images.push(image);
        }
        let handle = self.chains.insert(HeadlessChain {
            images: images.clone(),
            next: 0,
            stale: false,
        });
        Ok(OutputChain {
            handle,
            images,
            format: desc.format,
            extent: Extent::new(desc.extent.width, desc.extent.height),
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
        let chain = self.chains.get_mut(chain).ok_or_else(|| invalid("output chain"))?;
        if chain.stale {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let index = chain.next;
        chain.next = (chain.next + 1) % chain.images.len() as u32;
        *self.semaphores.get_mut(signal).ok_or_else(|| invalid("semaphore"))? = true;
        Ok(AcquireOutcome::Ready(index))
    }

    fn present(
        &mut self,
        chain: OutputChainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome> {
        let (image, stale) = {
            let chain = self.chains.get(chain).ok_or_else(|| invalid("output chain"))?;
            let image = *chain.images.get(image_index as usize).ok_or_else(|| {
                RenderError::device(DeviceErrorCode::InvalidHandle, "image index out of range")
            })?;
            (image, chain.stale)
        };
        let sem = self.semaphores.get_mut(wait).ok_or_else(|| invalid("semaphore"))?;
        if !*sem {
            return Err(RenderError::device(
                DeviceErrorCode::SubmissionFailed,
                "present waits on an unsignalled semaphore",
            ));
        }
        *sem = false;
        if stale {
            return Ok(PresentOutcome::OutOfDate);
        }
        self.expect_layout(image, 0, 0, ImageLayout::PresentSrc)?;
        self.presented += 1;
        Ok(PresentOutcome::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::command::CommandRecorder;

    fn image(device: &mut HeadlessDevice, layers: u32, mips: u32) -> ImageHandle {
        device
            .create_image(&ImageDesc {
                label: "test",
                width: 8,
                height: 8,
                layers,
                mip_levels: mips,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
            })
            .unwrap()
    }

    #[test]
    fn mismatched_barrier_is_rejected() {
        let mut device = HeadlessDevice::new();
        let img = image(&mut device, 1, 1);
        let mut rec = CommandRecorder::new("bad");
        rec.barrier(ImageBarrier::whole(
            img,
            ImageLayout::ColorAttachment,
            ImageLayout::ShaderReadOnly,
        ));
        let err = device.submit(rec.finish(), &SubmitInfo::default()).unwrap_err();
        assert_eq!(err.device_code(), Some(DeviceErrorCode::InvalidLayout));
    }

    #[test]
    fn undefined_source_discards_any_layout() {
        let mut device = HeadlessDevice::new();
        let img = image(&mut device, 2, 1);
        let mut rec = CommandRecorder::new("ok");
        rec.barrier(ImageBarrier::layers(
            img,
            2,
            ImageLayout::Undefined,
            ImageLayout::ShaderReadOnly,
        ));
        rec.barrier(ImageBarrier::layers(
            img,
            2,
            ImageLayout::Undefined,
            ImageLayout::DepthAttachment,
        ));
        device.submit(rec.finish(), &SubmitInfo::default()).unwrap();
        assert_eq!(device.image_layout(img, 1, 0), Some(ImageLayout::DepthAttachment));
    }

    #[test]
    fn destroyed_handles_are_detected() {
        let mut device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "b",
                size: 16,
                usage: wgpu::BufferUsages::STORAGE,
                host_visible: true,
            })
            .unwrap();
        device.destroy_buffer(buffer).unwrap();
        let err = device.write_buffer(buffer, 0, &[1, 2]).unwrap_err();
        assert_eq!(err.device_code(), Some(DeviceErrorCode::InvalidHandle));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn fence_must_be_reset_before_reuse() {
        let mut device = HeadlessDevice::new();
        let fence = device.create_fence(true).unwrap();
        let info = SubmitInfo {
            fence: Some(fence),
            ..Default::default()
        };
        assert!(device.submit(CommandList::default(), &info).is_err());
        device.reset_fence(fence).unwrap();
        device.submit(CommandList::default(), &info).unwrap();
        assert!(device.fence_signaled(fence).unwrap());
    }

    #[test]
    fn shader_without_entry_point_fails_soft() {
        let mut device = HeadlessDevice::new();
        let source = ShaderSource {
            label: "broken",
            wgsl: "fn other() {}".into(),
            entry_points: &["vs_main"],
        };
        assert!(device.compile_shader(&source).is_none());
    }
}
