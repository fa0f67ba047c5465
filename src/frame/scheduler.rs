//! Frame Scheduler
//!
//! Owns the frame slots and the output target, and rotates through the slots
//! round-robin. A frame is bracketed by [`FrameScheduler::begin_frame`] and
//! [`FrameScheduler::end_frame`]:
//!
//! ```text
//! begin: wait slot fence → acquire output image → reset fence → re-arm recorder
//! end:   submit (wait acquire, signal present, signal fence) → present → next slot
//! ```
//!
//! Headless runs render into a private draw image and never present. A stale
//! output surface is reported as [`FrameStart::OutOfDate`] or
//! [`FrameEnd::OutOfDate`]; the caller answers with [`FrameScheduler::recreate_output`].

use log::{debug, info};
use smallvec::smallvec;

use crate::errors::Result;
use crate::frame::slot::{DirtyFlags, FrameSlot};
use crate::gpu::{
    AcquireOutcome, Extent, GpuDevice, ImageDesc, ImageHandle, OutputChain, OutputChainDesc,
    PresentOutcome, SubmitInfo,
};
use crate::settings::RendererSettings;

pub enum OutputTarget {
    /// Offscreen draw image.
    Headless { image: ImageHandle, extent: Extent },
    Window { chain: OutputChain },
}

impl OutputTarget {
    #[must_use]
    pub fn extent(&self) -> Extent {
        match self {
            Self::Headless { extent, .. } => *extent,
            Self::Window { chain } => chain.extent,
        }
    }
}

/// A frame between `begin_frame` and `end_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveFrame {
    pub slot: usize,
    /// Number of frames begun before this one.
    pub frame_index: u64,
    pub output: ImageHandle,
    /// Output chain image index; `None` when headless.
    pub image_index: Option<u32>,
    pub extent: Extent,
    /// The chain still works but no longer matches the surface.
    pub suboptimal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    Ready(ActiveFrame),
    /// The output chain must be recreated before a frame can start.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    Presented,
    /// Submitted into the offscreen draw image.
    Offscreen,
    /// Submitted, but the output chain must be recreated.
    OutOfDate,
}

pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    current: usize,
    output: OutputTarget,
    output_format: wgpu::TextureFormat,
    vsync: bool,
    frames_begun: u64,
}

impl FrameScheduler {
    /// Creates one slot per frame in flight: two when `window` gives an
    /// initial surface extent, one otherwise.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        settings: &RendererSettings,
        window: Option<Extent>,
    ) -> Result<Self> {
        let frames_in_flight = RendererSettings::frames_in_flight(window.is_some());
        let output = match window {
            Some(extent) => OutputTarget::Window {
                chain: device.create_output_chain(&OutputChainDesc {
                    extent,
                    format: settings.output_format,
                    vsync: settings.vsync,
                })?,
            },
            None => {
                let (width, height) = settings.headless_extent;
                let extent = Extent::new(width, height);
                OutputTarget::Headless {
                    image: create_draw_image(device, extent, settings.output_format)?,
                    extent,
                }
            }
        };
        let slots = (0..frames_in_flight)
            .map(|i| FrameSlot::new(device, i, settings))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Frame scheduler: {frames_in_flight} frame(s) in flight, output {}x{}",
            output.extent().width,
            output.extent().height
        );
        Ok(Self {
            slots,
            current: 0,
            output,
            output_format: settings.output_format,
            vsync: settings.vsync,
            frames_begun: 0,
        })
    }

    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Frames begun so far.
    #[must_use]
    pub fn frames_begun(&self) -> u64 {
        self.frames_begun
    }

    #[must_use]
    pub fn is_windowed(&self) -> bool {
        matches!(self.output, OutputTarget::Window { .. })
    }

    #[must_use]
    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    #[must_use]
    pub fn output_extent(&self) -> Extent {
        self.output.extent()
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Marks binding tables dirty on every slot; each rewrites them lazily
    /// the next time it records.
    pub fn mark_all(&mut self, flags: DirtyFlags) {
        for slot in &mut self.slots {
            slot.dirty |= flags;
        }
    }

    /// Waits for the current slot and acquires an output image.
    pub fn begin_frame<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<FrameStart> {
        let slot = &mut self.slots[self.current];
        device.wait_fence(slot.fence)?;

        let (output, image_index, suboptimal) = match &self.output {
            OutputTarget::Headless { image, .. } => (*image, None, false),
            OutputTarget::Window { chain } => {
                match device.acquire_next_image(chain.handle, slot.acquire_semaphore)? {
                    AcquireOutcome::Ready(i) => (chain.images[i as usize], Some(i), false),
                    AcquireOutcome::Suboptimal(i) => (chain.images[i as usize], Some(i), true),
                    AcquireOutcome::OutOfDate => return Ok(FrameStart::OutOfDate),
                }
            }
        };

        // Only reset once a frame is certain to be submitted, so a failed
        // acquire leaves the fence signalled for the next attempt.
        device.reset_fence(slot.fence)?;
        slot.recorder.reset();

        let frame_index = self.frames_begun;
        self.frames_begun += 1;
        Ok(FrameStart::Ready(ActiveFrame {
            slot: self.current,
            frame_index,
            output,
            image_index,
            extent: self.output.extent(),
            suboptimal,
        }))
    }

    /// Submits the slot's commands, presents, and advances to the next slot.
    pub fn end_frame<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        frame: ActiveFrame,
    ) -> Result<FrameEnd> {
        let slot = &mut self.slots[frame.slot];
        let commands = slot.recorder.finish();
        let windowed = frame.image_index.is_some();
        let submit = if windowed {
            SubmitInfo {
                waits: smallvec![slot.acquire_semaphore],
                signals: smallvec![slot.present_semaphore],
                fence: Some(slot.fence),
            }
        } else {
            SubmitInfo {
                fence: Some(slot.fence),
                ..Default::default()
            }
        };
        device.submit(commands, &submit)?;
        let present_semaphore = slot.present_semaphore;
        self.current = (self.current + 1) % self.slots.len();

        let (OutputTarget::Window { chain }, Some(index)) = (&self.output, frame.image_index) else {
            return Ok(FrameEnd::Offscreen);
        };
        match device.present(chain.handle, index, present_semaphore)? {
            PresentOutcome::Presented if !frame.suboptimal => Ok(FrameEnd::Presented),
            PresentOutcome::Presented | PresentOutcome::OutOfDate => Ok(FrameEnd::OutOfDate),
        }
    }

    /// Rebuilds the output chain (or draw image) at `extent` after the queue
    /// went idle.
    pub fn recreate_output<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        extent: Extent,
    ) -> Result<()> {
        device.wait_idle()?;
        match &mut self.output {
            OutputTarget::Window { chain } => {
                device.destroy_output_chain(chain.handle)?;
                *chain = device.create_output_chain(&OutputChainDesc {
                    extent,
                    format: self.output_format,
                    vsync: self.vsync,
                })?;
            }
            OutputTarget::Headless {
                image,
                extent: current,
            } => {
                device.destroy_image(*image)?;
                *image = create_draw_image(device, extent, self.output_format)?;
                *current = extent;
            }
        }
        debug!("Recreated output at {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Releases every slot: all fences and semaphores first, then the
    /// per-frame buffers.
    pub fn destroy_slots<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        for slot in &self.slots {
            slot.destroy_sync(device)?;
        }
        for slot in self.slots.drain(..) {
            slot.destroy_buffers(device)?;
        }
        Ok(())
    }

    /// Releases any remaining slots, then the output target.
    pub fn destroy<D: GpuDevice + ?Sized>(mut self, device: &mut D) -> Result<()> {
        self.destroy_slots(device)?;
        match self.output {
            OutputTarget::Window { chain } => device.destroy_output_chain(chain.handle),
            OutputTarget::Headless { image, .. } => device.destroy_image(image),
        }
    }
}

fn create_draw_image<D: GpuDevice + ?Sized>(
    device: &mut D,
    extent: Extent,
    format: wgpu::TextureFormat,
) -> Result<ImageHandle> {
    device.create_image(&ImageDesc {
        label: "Draw Image",
        width: extent.width,
        height: extent.height,
        layers: 1,
        mip_levels: 1,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
    })
}
