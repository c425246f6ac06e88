use serde::{Deserialize, Serialize};

use crate::audio::levels::PEAK_DECAY_STEP;

/// The station being monitored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationTarget {
    pub name: String,
    pub stream_uri: String,
}

impl StationTarget {
    pub fn new(name: impl Into<String>, stream_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_uri: stream_uri.into(),
        }
    }
}

/// Level reading for one channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelLevel {
    /// Floored logarithmic level of the last read (41 = full scale, may be negative)
    pub instant: i32,
    /// Peak-hold value, decays linearly when not exceeded
    pub peak: f64,
}

impl ChannelLevel {
    /// Record a new instant level and advance the peak-hold
    pub fn update(&mut self, level: i32) {
        self.instant = level;
        if f64::from(level) > self.peak {
            self.peak = f64::from(level);
        } else if self.peak > 0.0 {
            self.peak = (self.peak - PEAK_DECAY_STEP).max(0.0);
        }
    }
}

/// Stereo VU reading produced by the level engine
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelState {
    pub left: ChannelLevel,
    pub right: ChannelLevel,
}
