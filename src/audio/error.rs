//! Error types for audio capture

use std::time::Duration;
use thiserror::Error;

/// Errors raised while finding or opening a capture device
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No enumerated capture device matched the selector
    #[error("No capture device matching '{0}'")]
    DeviceNotFound(String),

    /// The device exists but the stream could not be opened
    #[error("Failed to open capture device '{device}': {reason}")]
    DeviceOpen { device: String, reason: String },

    /// Device enumeration itself failed
    #[error("Failed to enumerate capture devices: {0}")]
    Enumeration(String),
}

/// Errors raised by a single buffer read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamReadError {
    #[error("Capture stream is not open")]
    NotOpen,

    /// Samples were dropped because the reader fell behind
    #[error("Capture buffer overrun")]
    Overrun,

    #[error("Timed out after {0:?} waiting for audio")]
    Timeout(Duration),

    #[error("Capture stream disconnected: {0}")]
    Disconnected(String),
}
