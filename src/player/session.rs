//! Playback session state
//!
//! ```text
//!   Stopped --Launch--> Starting --SpinUpElapsed--> Running
//!      ^                   |                           |
//!      +---- Stop / ProcessExited / AgedOut -----------+
//! ```
//!
//! `Launch` is accepted from every state; the supervisor runs the stop
//! cleanup before applying it.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Instant;

use super::launcher::PlayerHandle;
use super::registry::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Launch,
    SpinUpElapsed,
    ProcessExited,
    AgedOut,
    Stop,
}

impl SessionState {
    pub fn next(self, event: SessionEvent) -> SessionState {
        match (self, event) {
            (_, SessionEvent::Launch) => SessionState::Starting,
            (SessionState::Starting, SessionEvent::SpinUpElapsed) => SessionState::Running,
            // A late spin-up for a session already torn down changes nothing
            (state, SessionEvent::SpinUpElapsed) => state,
            (_, SessionEvent::ProcessExited | SessionEvent::AgedOut | SessionEvent::Stop) => {
                SessionState::Stopped
            }
        }
    }
}

/// Mutable state of one playback attempt, owned by the supervisor
#[derive(Default)]
pub struct PlaybackSession {
    pub state: SessionState,
    /// Wall-clock launch time, for display
    pub launched_at: Option<DateTime<Utc>>,
    /// Monotonic launch time the runtime cap is measured from
    pub started: Option<Instant>,
    pub tracked: Option<Box<dyn PlayerHandle>>,
    /// Tracked pid plus any sibling found by delta detection
    pub associated: BTreeSet<ProcessId>,
    /// Same-named processes seen right before the last spawn
    pub pre_launch_snapshot: BTreeSet<ProcessId>,
}

impl PlaybackSession {
    pub fn apply(&mut self, event: SessionEvent) {
        let next = self.state.next(event);
        if next != self.state {
            log::debug!("Playback session {:?} -> {:?} on {:?}", self.state, next, event);
        }
        self.state = next;
    }

    pub fn tracked_pid(&self) -> Option<ProcessId> {
        self.tracked.as_ref().map(|handle| handle.pid())
    }
}
