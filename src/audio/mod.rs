//! Audio capture and level metering
//!
//! This module provides:
//! - PipeWire capture of a microphone or sink monitor as interleaved S16LE
//! - Device lookup by name fragment
//! - Stereo VU levels with peak-hold decay

mod capture;
mod devices;
mod engine;
mod error;
pub mod levels;

pub use capture::{PipeWireBackend, StreamParams};
pub use devices::list_capture_devices;
pub use engine::AudioLevelEngine;
pub use error::StreamReadError;

#[cfg(test)]
pub use engine::testing;
