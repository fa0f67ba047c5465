//! Command recording.
//!
//! Passes never talk to the device directly while recording. They append
//! [`Command`]s to a [`CommandRecorder`], and the finished [`CommandList`] is
//! handed to [`GpuDevice::submit`](super::GpuDevice::submit) in one piece.

use bytemuck::{Pod, Zeroable};

use super::types::{
    BindingTableHandle, BufferHandle, ImageBarrier, ImageHandle, PipelineHandle, RenderingInfo,
};

/// Small per-draw constant block (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PushConstants(pub [u32; 16]);

impl PushConstants {
    pub const SIZE: u64 = 64;

    #[must_use]
    pub fn from_words(words: &[u32]) -> Self {
        let mut out = [0u32; 16];
        let n = words.len().min(16);
        out[..n].copy_from_slice(&words[..n]);
        Self(out)
    }

    /// Packs floats bit-for-bit after `head` integer words.
    #[must_use]
    pub fn from_mixed(head: &[u32], floats: &[f32]) -> Self {
        let mut out = Self::from_words(head);
        for (dst, f) in out.0.iter_mut().skip(head.len()).zip(floats) {
            *dst = f.to_bits();
        }
        out
    }

    #[must_use]
    pub fn word(&self, index: usize) -> u32 {
        self.0[index]
    }

    #[must_use]
    pub fn float(&self, index: usize) -> f32 {
        f32::from_bits(self.0[index])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(ImageBarrier),
    BeginRendering(RenderingInfo),
    EndRendering,
    SetPipeline(PipelineHandle),
    SetBindingTable {
        index: u32,
        table: BindingTableHandle,
    },
    SetConstants(PushConstants),
    SetVertexBuffer(BufferHandle),
    SetIndexBuffer(BufferHandle),
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Draw {
        vertex_count: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    /// Tightly packed rows into mip 0 of `layer`.
    CopyBufferToImage {
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
        layer: u32,
        width: u32,
        height: u32,
    },
    /// Downsamples `src_mip` (TransferSrc) into `src_mip + 1` (TransferDst).
    BlitMip {
        image: ImageHandle,
        src_mip: u32,
    },
    DebugMarker(&'static str),
}

/// An ordered, finished command stream ready for submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    pub label: &'static str,
    pub commands: Vec<Command>,
}

impl CommandList {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}

/// Append-only recording target owned by one frame slot or upload.
#[derive(Debug, Default)]
pub struct CommandRecorder {
    label: &'static str,
    commands: Vec<Command>,
    in_rendering: bool,
}

impl CommandRecorder {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            commands: Vec::new(),
            in_rendering: false,
        }
    }

    /// Drops anything recorded so far. Only legal once the previous
    /// submission of this recorder has completed.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.in_rendering = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn barrier(&mut self, barrier: ImageBarrier) {
        debug_assert!(!self.in_rendering, "barrier inside a rendering scope");
        self.commands.push(Command::Barrier(barrier));
    }

    pub fn begin_rendering(&mut self, info: RenderingInfo) {
        debug_assert!(!self.in_rendering, "nested rendering scope");
        self.in_rendering = true;
        self.commands.push(Command::BeginRendering(info));
    }

    pub fn end_rendering(&mut self) {
        debug_assert!(self.in_rendering, "end_rendering without begin");
        self.in_rendering = false;
        self.commands.push(Command::EndRendering);
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) {
        self.commands.push(Command::SetPipeline(pipeline));
    }

    pub fn set_binding_table(&mut self, index: u32, table: BindingTableHandle) {
        self.commands.push(Command::SetBindingTable { index, table });
    }

    pub fn set_constants(&mut self, constants: PushConstants) {
        self.commands.push(Command::SetConstants(constants));
    }

    pub fn set_vertex_buffer(&mut self, buffer: BufferHandle) {
        self.commands.push(Command::SetVertexBuffer(buffer));
    }

    pub fn set_index_buffer(&mut self, buffer: BufferHandle) {
        self.commands.push(Command::SetIndexBuffer(buffer));
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
        });
    }

    pub fn draw(&mut self, vertex_count: u32) {
        self.commands.push(Command::Draw { vertex_count });
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        if size == 0 {
            return;
        }
        self.commands.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
        layer: u32,
        width: u32,
        height: u32,
    ) {
        self.commands.push(Command::CopyBufferToImage {
            src,
            src_offset,
            dst,
            layer,
            width,
            height,
        });
    }

    pub fn blit_mip(&mut self, image: ImageHandle, src_mip: u32) {
        self.commands.push(Command::BlitMip { image, src_mip });
    }

    pub fn marker(&mut self, label: &'static str) {
        self.commands.push(Command::DebugMarker(label));
    }

    /// Takes the recorded commands, leaving the recorder empty.
    pub fn finish(&mut self) -> CommandList {
        debug_assert!(!self.in_rendering, "finish inside a rendering scope");
        self.in_rendering = false;
        CommandList {
            label: self.label,
            commands: std::mem::take(&mut self.commands),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_pack_floats_after_words() {
        let c = PushConstants::from_mixed(&[7, 9], &[1.5, -2.0]);
        assert_eq!(c.word(0), 7);
        assert_eq!(c.word(1), 9);
        assert_eq!(c.float(2), 1.5);
        assert_eq!(c.float(3), -2.0);
        assert_eq!(c.word(4), 0);
    }

    #[test]
    fn finish_drains_recorder() {
        let mut rec = CommandRecorder::new("test");
        rec.draw(3);
        rec.marker("m");
        let list = rec.finish();
        assert_eq!(list.commands.len(), 2);
        assert!(rec.is_empty());
        assert_eq!(list.label, "test");
    }

    #[test]
    fn zero_sized_copies_are_dropped() {
        let mut rec = CommandRecorder::new("test");
        rec.copy_buffer(BufferHandle::default(), 0, BufferHandle::default(), 0, 0);
        assert!(rec.is_empty());
    }
}
