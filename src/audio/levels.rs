//! VU level math
//!
//! Levels are on a 0..=41 display scale where 41 is full-scale amplitude.
//! Silence maps to a large negative number; the renderer clamps.

/// Level reported for a full-scale sample
pub const FULL_SCALE_LEVEL: f64 = 41.0;

/// Added to the amplitude so `log10(0)` stays finite
pub const SILENCE_EPSILON: f64 = 1e-40;

/// Peak-hold decay per read when no new peak occurs
pub const PEAK_DECAY_STEP: f64 = 0.2;

/// Magnitude of a full-scale signed 16-bit sample
pub const MAX_SAMPLE_MAGNITUDE: f64 = i16::MAX as f64;

/// Longest single level read; a read blocks the control loop for this long
pub const MAX_READ_SECONDS: f64 = 10.0;

/// Convert a normalized amplitude (0.0 - 1.0) to a floored log level
pub fn instant_level(amplitude: f64) -> i32 {
    (FULL_SCALE_LEVEL + 20.0 * (amplitude + SILENCE_EPSILON).log10()).floor() as i32
}

/// Largest absolute sample normalized to 0.0 - 1.0
///
/// `i16::MIN` has a magnitude one above `i16::MAX`, so the result is clamped.
pub fn peak_amplitude(samples: impl IntoIterator<Item = i16>) -> f64 {
    let max = samples
        .into_iter()
        .map(i16::unsigned_abs)
        .max()
        .unwrap_or(0);
    (f64::from(max) / MAX_SAMPLE_MAGNITUDE).min(1.0)
}

/// Iterate one channel of an interleaved buffer
///
/// Channels past the last one read the last channel, so mono input feeds
/// both sides of a stereo meter.
pub fn channel_samples(
    interleaved: &[i16],
    channels: usize,
    channel: usize,
) -> impl Iterator<Item = i16> + '_ {
    let channels = channels.max(1);
    interleaved
        .iter()
        .skip(channel.min(channels - 1))
        .step_by(channels)
        .copied()
}

/// Number of whole buffers covering `duration_secs`, at least one
///
/// Durations past [`MAX_READ_SECONDS`] are capped.
pub fn buffers_for_duration(sample_rate: u32, buffer_frames: u32, duration_secs: f64) -> usize {
    if buffer_frames == 0 || !(duration_secs > 0.0) {
        return 1;
    }
    let duration_secs = duration_secs.min(MAX_READ_SECONDS);
    let buffers = (f64::from(sample_rate) / f64::from(buffer_frames) * duration_secs).floor();
    if buffers.is_finite() && buffers >= 1.0 {
        buffers as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_is_41() {
        assert_eq!(instant_level(1.0), 41);
    }

    #[test]
    fn test_silence_is_finite() {
        // 41 + 20 * -40
        assert_eq!(instant_level(0.0), -759);
    }

    #[test]
    fn test_level_matches_formula() {
        for amplitude in [0.001, 0.01, 0.1, 0.25, 0.5, 0.75, 0.999] {
            let expected = (41.0 + 20.0 * f64::log10(amplitude + 1e-40)).floor() as i32;
            assert_eq!(instant_level(amplitude), expected, "amplitude {amplitude}");
        }
        assert_eq!(instant_level(0.5), 34);
        // -12.98 floors down, not toward zero
        assert_eq!(instant_level(0.002), -13);
    }

    #[test]
    fn test_peak_amplitude() {
        assert_eq!(peak_amplitude([0i16, 0, 0]), 0.0);
        assert_eq!(peak_amplitude(Vec::<i16>::new()), 0.0);
        assert_eq!(peak_amplitude([100, -32767, 5]), 1.0);
        assert_eq!(peak_amplitude([i16::MIN]), 1.0);
        assert!((peak_amplitude([16384]) - 16384.0 / 32767.0).abs() < 1e-12);
    }

    #[test]
    fn test_channel_samples_stereo() {
        let interleaved = [1, -1, 2, -2, 3, -3];
        let left: Vec<i16> = channel_samples(&interleaved, 2, 0).collect();
        let right: Vec<i16> = channel_samples(&interleaved, 2, 1).collect();
        assert_eq!(left, vec![1, 2, 3]);
        assert_eq!(right, vec![-1, -2, -3]);
    }

    #[test]
    fn test_channel_samples_mono_feeds_both() {
        let mono = [7, 8, 9];
        let left: Vec<i16> = channel_samples(&mono, 1, 0).collect();
        let right: Vec<i16> = channel_samples(&mono, 1, 1).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_buffers_for_duration() {
        assert_eq!(buffers_for_duration(44100, 4096, 0.2), 2);
        assert_eq!(buffers_for_duration(44100, 1024, 0.1), 4);
        assert_eq!(buffers_for_duration(44100, 4096, 0.01), 1);
        assert_eq!(buffers_for_duration(44100, 4096, 0.0), 1);
        assert_eq!(buffers_for_duration(44100, 0, 1.0), 1);
        assert_eq!(buffers_for_duration(44100, 4096, f64::NAN), 1);
    }

    #[test]
    fn test_buffers_for_duration_capped() {
        let cap = buffers_for_duration(44100, 1024, MAX_READ_SECONDS);
        assert_eq!(cap, 430);
        assert_eq!(buffers_for_duration(44100, 1024, 5e18), cap);
        assert_eq!(buffers_for_duration(44100, 1024, f64::INFINITY), cap);
    }
}
