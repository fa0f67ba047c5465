//! Window Contract
//!
//! The renderer only needs to know whether the window is open, its current
//! size, and a way to pump events while waiting for a usable size. Surface
//! creation from native handles is the backend's business.
//!
//! [`VirtualWindow`] is a host-controlled window for tests and offscreen
//! demos: clones share state, so a test can resize or close the window the
//! renderer is holding.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu::Extent;

pub trait WindowProvider: Send + Sync {
    fn is_open(&self) -> bool;
    fn size(&self) -> Extent;
    /// Processes pending window events. Called while polling for a size.
    fn poll_events(&self);
}

#[derive(Debug)]
struct WindowState {
    open: bool,
    size: Extent,
    /// Sizes that become current one per `poll_events` call.
    pending: Vec<Extent>,
}

#[derive(Debug, Clone)]
pub struct VirtualWindow {
    state: Arc<Mutex<WindowState>>,
}

impl VirtualWindow {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState {
                open: true,
                size: Extent::new(width, height),
                pending: Vec::new(),
            })),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.state.lock().size = Extent::new(width, height);
    }

    /// Queues sizes delivered by later `poll_events` calls, in order.
    pub fn queue_sizes(&self, sizes: &[Extent]) {
        let mut state = self.state.lock();
        state.pending.extend(sizes.iter().rev());
    }

    pub fn close(&self) {
        self.state.lock().open = false;
    }
}

impl WindowProvider for VirtualWindow {
    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn size(&self) -> Extent {
        self.state.lock().size
    }

    fn poll_events(&self) {
        let mut state = self.state.lock();
        if let Some(size) = state.pending.pop() {
            state.size = size;
        }
    }
}
