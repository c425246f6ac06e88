//! Which same-named player processes belong to this monitor
//!
//! The player forks a second process the spawn handle never sees, so the
//! supervisor finds its processes by looking at the OS process table. Two
//! strategies decide what counts as "ours":
//!
//! - [`NameMatch`]: every process with the player's executable name. This is
//!   the legacy behaviour and will kill players started by anyone else on
//!   the machine. Only safe when exactly one monitor runs per host.
//! - [`TagMatch`]: the player is spawned with a per-monitor environment
//!   marker that its forked child inherits; only processes carrying it count.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::launcher::LaunchCommand;
use super::registry::{ProcessId, ProcessRegistry};

/// Environment variable carrying the monitor tag
pub const TAG_ENV_KEY: &str = "STREAM_MONITOR_TAG";

pub trait ProcessOwnershipPolicy: Send {
    /// Live processes named `executable` that this monitor may treat as its own
    fn owned_processes(&self, registry: &dyn ProcessRegistry, executable: &str)
        -> BTreeSet<ProcessId>;

    /// Mark a command so its processes are recognised later
    fn tag(&self, command: &mut LaunchCommand);

    fn name(&self) -> &'static str;
}

/// Legacy strategy: any process with the player's name
#[derive(Debug, Default, Clone, Copy)]
pub struct NameMatch;

impl ProcessOwnershipPolicy for NameMatch {
    fn owned_processes(
        &self,
        registry: &dyn ProcessRegistry,
        executable: &str,
    ) -> BTreeSet<ProcessId> {
        registry.list_process_ids_by_name(executable)
    }

    fn tag(&self, _command: &mut LaunchCommand) {}

    fn name(&self) -> &'static str {
        "name-match"
    }
}

/// Default strategy: only processes carrying this monitor's tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    tag: String,
}

impl TagMatch {
    /// Tag unique to this monitor instance
    pub fn generate() -> Self {
        Self::with_tag(Uuid::new_v4().to_string())
    }

    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl ProcessOwnershipPolicy for TagMatch {
    fn owned_processes(
        &self,
        registry: &dyn ProcessRegistry,
        executable: &str,
    ) -> BTreeSet<ProcessId> {
        registry.list_process_ids_by_env(executable, TAG_ENV_KEY, &self.tag)
    }

    fn tag(&self, command: &mut LaunchCommand) {
        command.env.push((TAG_ENV_KEY.to_string(), self.tag.clone()));
    }

    fn name(&self) -> &'static str {
        "tag-match"
    }
}

/// Ownership strategy as named in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipMode {
    /// Legacy; kills every same-named process on the host
    Name,
    #[default]
    Tag,
}

impl OwnershipMode {
    pub fn build(self) -> Box<dyn ProcessOwnershipPolicy> {
        match self {
            OwnershipMode::Name => Box::new(NameMatch),
            OwnershipMode::Tag => Box::new(TagMatch::generate()),
        }
    }
}
