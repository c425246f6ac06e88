//! Playback supervisor
//!
//! Keeps one external player running against the station stream. The player
//! forks an extra process the spawn handle never sees, so every launch
//! snapshots the owned process set before spawning and takes the difference
//! afterwards. Continuous runtime is capped: the player's memory use grows
//! with uptime, and a periodic clean restart keeps the kiosk healthy.

use std::collections::BTreeSet;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use chrono::{DateTime, Utc};

use super::launcher::{LaunchCommand, PlayerHandle, PlayerLauncher, MIN_CACHE_KB};
use super::ownership::ProcessOwnershipPolicy;
use super::registry::{ProcessId, ProcessRegistry};
use super::session::{PlaybackSession, SessionEvent, SessionState};
use crate::clock::Clock;
use crate::models::StationTarget;

/// Supervisor timing and player settings
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Executable name, also used to find the player's processes
    pub executable: String,
    /// Longest a single session may run before a forced restart
    pub max_runtime: Duration,
    /// Wait after killing stale players before snapshotting
    pub settle: Duration,
    /// Wait after spawning for the forked second process to appear
    pub spin_up: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: "mplayer".to_string(),
            max_runtime: Duration::from_secs(3600),
            settle: Duration::from_secs(1),
            spin_up: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited during start-up")]
    ExitedDuringSpinUp { program: String },
}

pub struct PlaybackSupervisor {
    config: SupervisorConfig,
    registry: Box<dyn ProcessRegistry>,
    launcher: Box<dyn PlayerLauncher>,
    policy: Box<dyn ProcessOwnershipPolicy>,
    clock: Arc<dyn Clock>,
    session: PlaybackSession,
    /// Signalled children not yet reaped
    exiting: Vec<Box<dyn PlayerHandle>>,
}

impl PlaybackSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Box<dyn ProcessRegistry>,
        launcher: Box<dyn PlayerLauncher>,
        policy: Box<dyn ProcessOwnershipPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        log::debug!(
            "Supervising '{}' with {} ownership",
            config.executable,
            policy.name()
        );
        Self {
            config,
            registry,
            launcher,
            policy,
            clock,
            session: PlaybackSession::default(),
            exiting: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn launched_at(&self) -> Option<DateTime<Utc>> {
        self.session.launched_at
    }

    pub fn associated_process_ids(&self) -> &BTreeSet<ProcessId> {
        &self.session.associated
    }

    pub fn pre_launch_snapshot(&self) -> &BTreeSet<ProcessId> {
        &self.session.pre_launch_snapshot
    }

    /// Start a fresh player session for `target`
    ///
    /// Blocks for the settle interval (only when stale processes had to be
    /// terminated) and for the spin-up interval.
    pub fn launch(
        &mut self,
        target: &StationTarget,
        cache_kb: u32,
        extra_args: &[String],
    ) -> Result<(), LaunchError> {
        self.clear_previous_session();

        if cache_kb < MIN_CACHE_KB {
            log::debug!("Cache of {} KB raised to {} KB", cache_kb, MIN_CACHE_KB);
        }
        let mut command =
            LaunchCommand::player(&self.config.executable, extra_args, cache_kb, &target.stream_uri);
        self.policy.tag(&mut command);

        self.session.pre_launch_snapshot = self.owned_processes();

        let handle = self
            .launcher
            .spawn(&command)
            .map_err(|source| LaunchError::Spawn {
                program: self.config.executable.clone(),
                source,
            })?;
        log::info!(
            "Started {} (pid {}) for '{}' at {}",
            self.config.executable,
            handle.pid(),
            target.name,
            target.stream_uri
        );

        self.session.tracked = Some(handle);
        self.session.launched_at = Some(self.clock.now());
        self.session.started = Some(self.clock.monotonic());
        self.session.apply(SessionEvent::Launch);

        self.clock.sleep(self.config.spin_up);

        let mut associated: BTreeSet<ProcessId> = self
            .owned_processes()
            .difference(&self.session.pre_launch_snapshot)
            .copied()
            .collect();

        let tracked_exited = match self.session.tracked.as_mut() {
            Some(handle) => handle.has_exited().unwrap_or(false),
            None => true,
        };
        if tracked_exited {
            log::warn!(
                "{} exited during start-up; leftover processes: {:?}",
                self.config.executable,
                associated
            );
            self.session.tracked = None;
            self.session.associated = associated;
            self.session.apply(SessionEvent::ProcessExited);
            return Err(LaunchError::ExitedDuringSpinUp {
                program: self.config.executable.clone(),
            });
        }

        associated.extend(self.session.tracked_pid());
        log::debug!("Player processes for this session: {:?}", associated);
        self.session.associated = associated;
        self.session.apply(SessionEvent::SpinUpElapsed);
        Ok(())
    }

    /// Terminate every process of the current session; idempotent
    pub fn stop(&mut self) {
        self.end_session(SessionEvent::Stop);
    }

    /// Whether the player is still running and within its runtime budget
    ///
    /// Returns false when the tracked process has exited or when the session
    /// reached the maximum runtime; in the latter case the session is stopped
    /// here and the caller is expected to launch again.
    pub fn is_alive(&mut self) -> bool {
        self.reap_exiting();

        let Some(handle) = self.session.tracked.as_mut() else {
            self.session.apply(SessionEvent::ProcessExited);
            return false;
        };

        match handle.has_exited() {
            Ok(true) => {
                // Reaped, so the pid may already belong to another process
                let pid = handle.pid();
                log::warn!("Player process {} exited", pid);
                self.session.associated.remove(&pid);
                self.session.tracked = None;
                self.session.apply(SessionEvent::ProcessExited);
                return false;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Failed to poll player process {}: {}", handle.pid(), e),
        }

        let Some(started) = self.session.started else {
            return false;
        };

        let elapsed = self.clock.monotonic().saturating_duration_since(started);
        if elapsed >= self.config.max_runtime {
            log::info!(
                "Player has run for {}s (limit {}s), restarting",
                elapsed.as_secs(),
                self.config.max_runtime.as_secs()
            );
            self.end_session(SessionEvent::AgedOut);
            return false;
        }

        true
    }

    fn owned_processes(&self) -> BTreeSet<ProcessId> {
        self.policy
            .owned_processes(self.registry.as_ref(), &self.config.executable)
    }

    /// Pids of this session that are still safe to signal
    ///
    /// The tracked child is unreaped and cannot be reused. Any other pid must
    /// still be on the owned list; a sibling that exited may have had its pid
    /// handed to an unrelated process.
    fn take_session_pids(&mut self, owned: &BTreeSet<ProcessId>) -> BTreeSet<ProcessId> {
        let (mut pids, gone): (BTreeSet<ProcessId>, BTreeSet<ProcessId>) =
            mem::take(&mut self.session.associated)
                .into_iter()
                .partition(|pid| owned.contains(pid));
        if !gone.is_empty() {
            log::debug!("Player processes {:?} already gone, not signalling", gone);
        }
        pids.extend(self.session.tracked_pid());
        pids
    }

    /// Kill whatever the last session (or an earlier run) left behind
    fn clear_previous_session(&mut self) {
        self.reap_exiting();

        // With name-match ownership this includes players this monitor never started
        let owned = self.owned_processes();
        let mut stale = self.take_session_pids(&owned);
        stale.extend(owned);

        if let Some(handle) = self.session.tracked.take() {
            self.exiting.push(handle);
        }
        self.session.launched_at = None;
        self.session.started = None;
        self.session.apply(SessionEvent::Stop);

        if !stale.is_empty() {
            log::info!("Terminating stale player processes {:?}", stale);
            self.terminate_all(&stale);
            self.clock.sleep(self.config.settle);
            self.reap_exiting();
        }
    }

    fn end_session(&mut self, event: SessionEvent) {
        let owned = self.owned_processes();
        let pids = self.take_session_pids(&owned);

        if !pids.is_empty() {
            log::info!("Stopping player processes {:?}", pids);
            self.terminate_all(&pids);
        }
        if let Some(handle) = self.session.tracked.take() {
            self.exiting.push(handle);
        }
        self.reap_exiting();

        self.session.launched_at = None;
        self.session.started = None;
        self.session.apply(event);
    }

    fn terminate_all(&self, pids: &BTreeSet<ProcessId>) {
        for &pid in pids {
            if !self.registry.terminate(pid) {
                log::debug!("Player process {} already gone", pid);
            }
        }
    }

    fn reap_exiting(&mut self) {
        self.exiting
            .retain_mut(|handle| !handle.has_exited().unwrap_or(true));
    }
}

impl Drop for PlaybackSupervisor {
    fn drop(&mut self) {
        if self.session.state != SessionState::Stopped
            || !self.session.associated.is_empty()
            || self.session.tracked.is_some()
        {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::player::launcher::testing::FakeLauncher;
    use crate::player::ownership::{NameMatch, TagMatch, TAG_ENV_KEY};
    use crate::player::registry::testing::FakeRegistry;

    struct Harness {
        registry: FakeRegistry,
        launcher: FakeLauncher,
        clock: Arc<ManualClock>,
        supervisor: PlaybackSupervisor,
    }

    fn harness_with(
        policy: Box<dyn ProcessOwnershipPolicy>,
        setup: impl FnOnce(&FakeRegistry, &mut FakeLauncher),
    ) -> Harness {
        let registry = FakeRegistry::default();
        let mut launcher = FakeLauncher::new(registry.clone(), 101);
        setup(&registry, &mut launcher);
        let clock = Arc::new(ManualClock::new());
        let supervisor = PlaybackSupervisor::new(
            SupervisorConfig::default(),
            Box::new(registry.clone()),
            Box::new(launcher.clone()),
            policy,
            clock.clone(),
        );
        Harness {
            registry,
            launcher,
            clock,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(Box::new(NameMatch), |_, _| {})
    }

    fn station() -> StationTarget {
        StationTarget::new("KXYZ", "http://127.0.0.1:8000/live")
    }

    fn ids(pids: &[ProcessId]) -> BTreeSet<ProcessId> {
        pids.iter().copied().collect()
    }

    #[test]
    fn test_launch_tracks_player_and_sibling() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert_eq!(h.supervisor.state(), SessionState::Running);
        assert!(h.supervisor.launched_at().is_some());
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[101, 102]));
        // Nothing stale, so only the spin-up wait
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_delta_excludes_pre_existing_player() {
        let mut h = harness_with(Box::new(NameMatch), |registry, _| {
            registry.add_stubborn(100, "mplayer");
        });

        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert_eq!(h.supervisor.pre_launch_snapshot(), &ids(&[100]));
        assert_eq!(
            h.registry.list_process_ids_by_name("mplayer"),
            ids(&[100, 101, 102])
        );
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[101, 102]));
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_launch_then_stop() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();
        h.supervisor.stop();

        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        assert!(h.supervisor.associated_process_ids().is_empty());
        assert!(h.supervisor.launched_at().is_none());
        assert!(!h.registry.is_running(101));
        assert!(!h.registry.is_running(102));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        h.supervisor.stop();
        let terminated = h.registry.terminated();
        let state = h.supervisor.state();

        h.supervisor.stop();
        assert_eq!(h.supervisor.state(), state);
        assert!(h.supervisor.associated_process_ids().is_empty());
        assert!(h.supervisor.launched_at().is_none());
        assert_eq!(h.registry.terminated(), terminated);
    }

    #[test]
    fn test_stop_on_fresh_supervisor() {
        let mut h = harness();
        h.supervisor.stop();
        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        assert!(h.registry.terminated().is_empty());
    }

    #[test]
    fn test_is_alive_within_runtime() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        h.clock.advance(Duration::from_secs(3590));
        assert!(h.supervisor.is_alive());
        assert_eq!(h.supervisor.state(), SessionState::Running);
    }

    #[test]
    fn test_is_alive_ages_out_running_player() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        // Spin-up already consumed 2s of the hour
        h.clock.advance(Duration::from_secs(3598));
        assert!(h.registry.is_running(101));
        assert!(!h.supervisor.is_alive());

        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        assert!(h.supervisor.associated_process_ids().is_empty());
        assert!(!h.registry.is_running(101));
        assert!(!h.registry.is_running(102));
    }

    #[test]
    fn test_is_alive_detects_exit() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        h.registry.remove(101);
        assert!(!h.supervisor.is_alive());
        assert_eq!(h.supervisor.state(), SessionState::Stopped);

        // The forked sibling is still ours and gets cleaned up on relaunch
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[102]));
        h.supervisor.launch(&station(), 320, &[]).unwrap();
        assert!(!h.registry.is_running(102));
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[103, 104]));
    }

    #[test]
    fn test_reused_pid_of_exited_player_is_spared() {
        let mut h = harness_with(Box::new(TagMatch::with_tag("ours")), |_, _| {});
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        h.registry.remove(101);
        assert!(!h.supervisor.is_alive());
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[102]));

        // The OS hands the freed pid to an unrelated process
        h.registry.add(101, "bash", Vec::new());
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert!(h.registry.is_running(101));
        assert!(!h.registry.terminated().contains(&101));
        assert!(!h.registry.is_running(102));
    }

    #[test]
    fn test_stop_skips_sibling_pid_taken_over() {
        let mut h = harness_with(Box::new(TagMatch::with_tag("ours")), |_, _| {});
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        // Sibling exits on its own and its pid is reused
        h.registry.remove(102);
        h.registry.add(102, "sshd", Vec::new());
        h.supervisor.stop();

        assert!(h.registry.is_running(102));
        assert_eq!(h.registry.terminated(), vec![101]);
    }

    #[test]
    fn test_wall_clock_step_does_not_delay_restart() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();
        let launched_at = h.supervisor.launched_at();

        h.clock.step_wall_clock_back(Duration::from_secs(1800));
        h.clock.advance(Duration::from_secs(3598));

        assert!(!h.supervisor.is_alive());
        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        assert!(!h.registry.is_running(101));
        assert!(launched_at.is_some());
    }

    #[test]
    fn test_is_alive_before_launch() {
        let mut h = harness();
        assert!(!h.supervisor.is_alive());
        assert_eq!(h.supervisor.state(), SessionState::Stopped);
    }

    #[test]
    fn test_relaunch_never_accumulates() {
        let mut h = harness();
        h.supervisor.launch(&station(), 320, &[]).unwrap();
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[103, 104]));
        assert!(!h.registry.is_running(101));
        assert!(!h.registry.is_running(102));
        assert_eq!(h.launcher.spawn_count(), 2);
    }

    #[test]
    fn test_tag_match_spares_foreign_players() {
        let mut h = harness_with(Box::new(TagMatch::with_tag("ours")), |registry, _| {
            registry.add(50, "mplayer", Vec::new());
        });
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert!(h.registry.is_running(50));
        assert!(!h.registry.terminated().contains(&50));
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[101, 102]));

        let command = h.launcher.last_command().unwrap();
        assert!(command
            .env
            .contains(&(TAG_ENV_KEY.to_string(), "ours".to_string())));
    }

    #[test]
    fn test_name_match_kills_foreign_players() {
        let mut h = harness_with(Box::new(NameMatch), |registry, _| {
            registry.add(50, "mplayer", Vec::new());
        });
        h.supervisor.launch(&station(), 320, &[]).unwrap();

        assert!(!h.registry.is_running(50));
        assert!(h.registry.terminated().contains(&50));
    }

    #[test]
    fn test_launch_passes_args_and_clamps_cache() {
        let mut h = harness();
        let extra = vec!["-ao".to_string(), "alsa".to_string()];
        h.supervisor.launch(&station(), 8, &extra).unwrap();

        let command = h.launcher.last_command().unwrap();
        assert_eq!(command.program, "mplayer");
        assert_eq!(
            command.args,
            vec!["-ao", "alsa", "-cache", "32", "http://127.0.0.1:8000/live"]
        );
    }

    #[test]
    fn test_spawn_failure() {
        let mut h = harness();
        *h.launcher.fail.lock().unwrap() = true;

        let err = h.supervisor.launch(&station(), 320, &[]).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        assert!(h.supervisor.launched_at().is_none());
    }

    #[test]
    fn test_exit_during_spin_up() {
        let mut h = harness_with(Box::new(NameMatch), |_, launcher| {
            launcher.tracked_dies = true;
        });

        let err = h.supervisor.launch(&station(), 320, &[]).unwrap_err();
        assert!(matches!(err, LaunchError::ExitedDuringSpinUp { .. }));
        assert_eq!(h.supervisor.state(), SessionState::Stopped);
        // The orphaned sibling is remembered so the next launch removes it
        assert_eq!(h.supervisor.associated_process_ids(), &ids(&[102]));
        assert!(!h.supervisor.is_alive());
    }

    #[test]
    fn test_drop_stops_session() {
        let h = harness();
        let Harness {
            registry,
            mut supervisor,
            ..
        } = h;
        supervisor.launch(&station(), 320, &[]).unwrap();
        drop(supervisor);

        assert!(!registry.is_running(101));
        assert!(!registry.is_running(102));
    }
}
