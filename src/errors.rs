//! Error Types
//!
//! This module defines the error types used throughout the renderer.
//!
//! # Overview
//!
//! [`RenderError`] distinguishes between:
//! - Fatal device errors, carried as a [`DeviceErrorCode`] plus context
//! - Capacity and lookup misuse by the host
//! - Initialization failures (adapter, device, window)
//!
//! Stale presentation surfaces are *not* errors: they are reported as
//! [`AcquireOutcome::OutOfDate`](crate::gpu::AcquireOutcome) and handled by
//! the resize path. Shader compilation failures are soft and surface as `None`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ember::errors::{RenderError, Result};
//!
//! fn upload() -> Result<()> {
//!     Ok(())
//! }
//! ```

use std::fmt;

use thiserror::Error;

/// Code attached to a fatal device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    OutOfMemory,
    /// A handle was used after being destroyed, or never existed.
    InvalidHandle,
    SubmissionFailed,
    SurfaceLost,
    /// A barrier or attachment did not match the tracked image layout.
    InvalidLayout,
    Unknown,
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::SubmissionFailed => "SUBMISSION_FAILED",
            Self::SurfaceLost => "SURFACE_LOST",
            Self::InvalidLayout => "INVALID_LAYOUT",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// The main error type for the renderer.
#[derive(Error, Debug)]
pub enum RenderError {
    // ========================================================================
    // Device Errors
    // ========================================================================
    /// Failed to request a compatible GPU adapter.
    #[error("Failed to request GPU adapter: {0}")]
    AdapterRequestFailed(String),

    /// Failed to create the logical device.
    #[error("Failed to create GPU device: {0}")]
    DeviceCreateFailed(String),

    /// An unexpected failure returned by a device call. Never retried.
    #[error("Device error [{code}]: {context}")]
    Device {
        code: DeviceErrorCode,
        context: String,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// A fixed-capacity table is full.
    #[error("{resource} capacity exceeded (capacity: {capacity})")]
    CapacityExceeded {
        resource: &'static str,
        capacity: usize,
    },

    /// Source asset data is malformed (size mismatch, zero extent, ...).
    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    /// An id handed back by the host does not name a loaded resource.
    #[error("Unknown {kind} id: {index}")]
    UnknownResource { kind: &'static str, index: u32 },

    /// A pipeline required for the operation failed to build.
    #[error("Pipeline unavailable: {0}")]
    PipelineUnavailable(&'static str),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The module was used before `init` or after `destroy`.
    #[error("Renderer is not initialized")]
    NotInitialized,

    /// The window closed while waiting for a usable surface.
    #[error("Window was closed")]
    WindowClosed,
}

impl RenderError {
    /// Shorthand for a coded device error.
    pub fn device(code: DeviceErrorCode, context: impl Into<String>) -> Self {
        Self::Device {
            code,
            context: context.into(),
        }
    }

    /// Returns the device error code, if this is a device error.
    #[must_use]
    pub fn device_code(&self) -> Option<DeviceErrorCode> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Alias for `Result<T, RenderError>`.
pub type Result<T> = std::result::Result<T, RenderError>;
