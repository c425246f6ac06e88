//! Spawning the external player

use std::io;
use std::process::{Child, Command, Stdio};

use super::registry::ProcessId;

/// Minimum cache mplayer accepts for `-cache`, in kilobytes
pub const MIN_CACHE_KB: u32 = 32;

/// Program, arguments and extra environment for one player launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// `<player> <extra args...> -cache <kb> <uri>`, with the cache clamped to [`MIN_CACHE_KB`]
    pub fn player(executable: &str, extra_args: &[String], cache_kb: u32, stream_uri: &str) -> Self {
        let mut command = Self::new(executable);
        command.args.extend(extra_args.iter().cloned());
        command.args.push("-cache".to_string());
        command.args.push(cache_kb.max(MIN_CACHE_KB).to_string());
        command.args.push(stream_uri.to_string());
        command
    }
}

/// Handle to a spawned player process
pub trait PlayerHandle: Send {
    fn pid(&self) -> ProcessId;

    /// Non-blocking exit check; reaps the process when it has exited
    fn has_exited(&mut self) -> io::Result<bool>;
}

pub trait PlayerLauncher: Send {
    fn spawn(&self, command: &LaunchCommand) -> io::Result<Box<dyn PlayerHandle>>;
}

/// Launches players as child processes with output discarded
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildLauncher;

impl PlayerLauncher for ChildLauncher {
    fn spawn(&self, command: &LaunchCommand) -> io::Result<Box<dyn PlayerHandle>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

impl PlayerHandle for ChildHandle {
    fn pid(&self) -> ProcessId {
        self.child.id()
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        match self.child.try_wait()? {
            Some(status) => {
                log::debug!("Player {} exited with {}", self.child.id(), status);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
