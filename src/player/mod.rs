//! External player supervision
//!
//! This module provides:
//! - Process lookup and signalling through `sysinfo`
//! - Ownership strategies for deciding which player processes are ours
//! - The playback supervisor and its session state machine

mod launcher;
mod ownership;
mod registry;
mod session;
mod supervisor;

pub use launcher::ChildLauncher;
pub use ownership::OwnershipMode;
pub use registry::SystemProcessRegistry;
pub use supervisor::{LaunchError, PlaybackSupervisor, SupervisorConfig};

#[cfg(test)]
pub use ownership::NameMatch;
#[cfg(test)]
pub use session::SessionState;

#[cfg(test)]
pub mod testing {
    pub use super::launcher::testing::*;
    pub use super::registry::testing::*;
}
