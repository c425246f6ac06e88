//! OS process lookup and signalling

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};

pub type ProcessId = u32;

/// Queries and signals live OS processes
pub trait ProcessRegistry: Send {
    /// Processes whose executable name is exactly `name`
    fn list_process_ids_by_name(&self, name: &str) -> BTreeSet<ProcessId>;

    /// Processes named `name` whose environment contains `key=value`
    fn list_process_ids_by_env(&self, name: &str, key: &str, value: &str) -> BTreeSet<ProcessId>;

    /// Send SIGTERM; false if the process is already gone
    fn terminate(&self, pid: ProcessId) -> bool;
}

/// Registry backed by `sysinfo`
pub struct SystemProcessRegistry {
    system: Mutex<System>,
}

impl SystemProcessRegistry {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn scan<F>(&self, name: &str, with_environ: bool, mut keep: F) -> BTreeSet<ProcessId>
    where
        F: FnMut(&sysinfo::Process) -> bool,
    {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        let refresh = if with_environ {
            ProcessRefreshKind::nothing().with_environ(UpdateKind::Always)
        } else {
            ProcessRefreshKind::nothing()
        };
        // Processes that exit mid-scan are dropped by sysinfo rather than erroring
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);

        let name = OsStr::new(name);
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter(|(_, process)| process.name() == name)
            .filter(|(_, process)| keep(process))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }
}

impl Default for SystemProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry for SystemProcessRegistry {
    fn list_process_ids_by_name(&self, name: &str) -> BTreeSet<ProcessId> {
        self.scan(name, false, |_| true)
    }

    fn list_process_ids_by_env(&self, name: &str, key: &str, value: &str) -> BTreeSet<ProcessId> {
        let entry = format!("{}={}", key, value);
        let entry = OsStr::new(&entry);
        self.scan(name, true, |process| {
            process.environ().iter().any(|e| e.as_os_str() == entry)
        })
    }

    fn terminate(&self, pid: ProcessId) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        match system.process(pid) {
            Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
            None => false,
        }
    }
}
