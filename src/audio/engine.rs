//! Level engine: owns one capture stream and turns its buffers into VU readings

use super::capture::{CaptureBackend, CaptureStream, StreamParams};
use super::devices::select_device;
use super::error::{CaptureError, StreamReadError};
use super::levels::{buffers_for_duration, channel_samples, instant_level, peak_amplitude};
use crate::models::LevelState;

pub struct AudioLevelEngine {
    backend: Box<dyn CaptureBackend>,
    params: Option<StreamParams>,
    stream: Option<Box<dyn CaptureStream>>,
    levels: LevelState,
}

impl AudioLevelEngine {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            params: None,
            stream: None,
            levels: LevelState::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open a capture stream on the first device whose name contains `params.device`
    ///
    /// Any stream already open is closed first. The parameters are remembered
    /// for [`reopen`](Self::reopen).
    pub fn open_stream(&mut self, params: StreamParams) -> Result<(), CaptureError> {
        self.close();

        let devices = self.backend.list_devices()?;
        let device = select_device(&devices, |d| d.matches(&params.device))
            .ok_or_else(|| CaptureError::DeviceNotFound(params.device.clone()))?;

        log::debug!("Selected capture device {} ({})", device.name, device.id);
        let stream = self.backend.open(&device, &params)?;

        self.stream = Some(stream);
        self.params = Some(params);
        Ok(())
    }

    /// Close and open again with the last parameters
    pub fn reopen(&mut self) -> Result<(), CaptureError> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| CaptureError::DeviceNotFound(String::new()))?;
        self.open_stream(params)
    }

    /// Read enough whole buffers to cover `duration_secs` and update levels
    ///
    /// Each buffer is folded into a running per-channel peak and dropped, so
    /// memory stays at one buffer whatever the duration. Read errors are
    /// returned as-is; the caller decides how to recover.
    pub fn read_levels(&mut self, duration_secs: f64) -> Result<LevelState, StreamReadError> {
        let (Some(stream), Some(params)) = (self.stream.as_mut(), self.params.as_ref()) else {
            return Err(StreamReadError::NotOpen);
        };

        let buffers = buffers_for_duration(params.sample_rate, params.buffer_frames, duration_secs);
        let channels = usize::from(params.channels.max(1));

        let (mut left_peak, mut right_peak) = (0.0_f64, 0.0_f64);
        for _ in 0..buffers {
            let data = stream.read_buffer(params.buffer_frames)?;
            left_peak = left_peak.max(peak_amplitude(channel_samples(&data, channels, 0)));
            right_peak = right_peak.max(peak_amplitude(channel_samples(&data, channels, 1)));
        }

        let left = instant_level(left_peak);
        let right = instant_level(right_peak);
        self.levels.left.update(left);
        self.levels.right.update(right);

        log::trace!("Levels L={} R={}", left, right);
        Ok(self.levels)
    }

    /// Release the capture stream; safe to call more than once
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

impl Drop for AudioLevelEngine {
    fn drop(&mut self) {
        self.close();
    }
}
