use std::borrow::Cow;

use smallvec::SmallVec;

use super::command::CommandList;
use super::types::{
    AcquireOutcome, BindingLayoutDesc, BindingLayoutHandle, BindingTableHandle, BindingWrite,
    BufferDesc, BufferHandle, DeviceInfo, FenceHandle, ImageDesc, ImageHandle, OutputChain,
    OutputChainDesc, OutputChainHandle, PipelineDesc, PipelineHandle, PresentOutcome, SamplerDesc,
    SamplerHandle, SemaphoreHandle, ShaderModuleHandle,
};
use crate::errors::Result;

/// Preprocessed shader text handed to the device for compilation.
#[derive(Debug, Clone)]
pub struct ShaderSource<'a> {
    pub label: &'a str,
    pub wgsl: Cow<'a, str>,
    /// Entry points the caller will reference when building pipelines.
    pub entry_points: &'a [&'a str],
}

/// Synchronization attached to one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub waits: SmallVec<[SemaphoreHandle; 2]>,
    pub signals: SmallVec<[SemaphoreHandle; 2]>,
    /// Signalled once every command of the submission has executed.
    pub fence: Option<FenceHandle>,
}

/// Seam between the frame core and a concrete GPU.
///
/// All creation calls return generational handles. Any unexpected failure is
/// a coded [`RenderError::Device`](crate::errors::RenderError::Device) and is
/// fatal to the caller. The exceptions are shader compilation, which fails
/// soft with `None`, and presentation, which reports staleness as a value.
pub trait GpuDevice {
    fn info(&self) -> &DeviceInfo;

    // === Buffers ===
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;
    /// Writes host data into a host-visible buffer.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    // === Images & samplers ===
    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle>;
    fn destroy_image(&mut self, image: ImageHandle) -> Result<()>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()>;

    // === Binding tables ===
    fn create_binding_layout(&mut self, desc: &BindingLayoutDesc<'_>)
    -> Result<BindingLayoutHandle>;
    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) -> Result<()>;
    fn create_binding_table(
        &mut self,
        label: &str,
        layout: BindingLayoutHandle,
    ) -> Result<BindingTableHandle>;
    /// Replaces the listed bindings of a table that is not in use by the GPU.
    fn write_binding_table(
        &mut self,
        table: BindingTableHandle,
        writes: &[BindingWrite],
    ) -> Result<()>;
    fn destroy_binding_table(&mut self, table: BindingTableHandle) -> Result<()>;

    // === Shaders & pipelines ===
    fn compile_shader(&mut self, source: &ShaderSource<'_>) -> Option<ShaderModuleHandle>;
    fn destroy_shader(&mut self, shader: ShaderModuleHandle) -> Result<()>;
    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;

    // === Synchronization ===
    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle>;
    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()>;
    /// Blocks until the fence is signalled.
    fn wait_fence(&mut self, fence: FenceHandle) -> Result<()>;
    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()>;
    fn fence_signaled(&self, fence: FenceHandle) -> Result<bool>;
    fn create_semaphore(&mut self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()>;

    // === Submission ===
    fn submit(&mut self, commands: CommandList, info: &SubmitInfo) -> Result<()>;
    /// Blocks until every submission so far has completed.
    fn wait_idle(&mut self) -> Result<()>;

    // === Presentation ===
    fn create_output_chain(&mut self, desc: &OutputChainDesc) -> Result<OutputChain>;
    fn destroy_output_chain(&mut self, chain: OutputChainHandle) -> Result<()>;
    fn acquire_next_image(
        &mut self,
        chain: OutputChainHandle,
        signal: SemaphoreHandle,
    ) -> Result<AcquireOutcome>;
    fn present(
        &mut self,
        chain: OutputChainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome>;
}
