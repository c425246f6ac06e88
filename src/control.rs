//! Main monitoring loop
//!
//! Each iteration refreshes stats in the background, keeps the player
//! running, reads one block of levels and redraws. A failed launch or read
//! triggers recovery: a short pause, then the capture stream is closed and
//! reopened. The player session is left alone by recovery; it has its own
//! liveness check at the top of the next iteration.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};

use crate::audio::{AudioLevelEngine, StreamReadError};
use crate::clock::Clock;
use crate::models::StationTarget;
use crate::player::{LaunchError, PlaybackSupervisor};
use crate::render::Renderer;
use crate::stats::{StatsPanel, StatsProvider};

/// Pause before recreating the capture stream
pub const RECOVERY_PAUSE: Duration = Duration::from_millis(100);

/// How often the key watcher checks whether shutdown already started
const KEY_POLL: Duration = Duration::from_millis(200);

/// Esc, `q` or Ctrl+C; raw mode turns Ctrl+C into a key press
pub fn is_quit_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Esc => true,
        KeyCode::Char('q') => key.modifiers == KeyModifiers::NONE,
        KeyCode::Char('c') => key.modifiers == KeyModifiers::CONTROL,
        _ => false,
    }
}

/// Cross-thread request to shut down
#[derive(Clone, Default)]
pub struct QuitSignal {
    flag: Arc<AtomicBool>,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Set the flag on SIGINT or SIGTERM
    pub fn install_handlers(&self, handle: &Handle) -> io::Result<()> {
        let _guard = handle.enter();
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let quit = self.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => log::info!("Interrupted"),
                _ = terminate.recv() => log::info!("Terminated"),
            }
            quit.trigger();
        });
        Ok(())
    }

    /// Set the flag when a quit key is pressed; needs the terminal in raw mode
    pub fn watch_keys(&self, handle: &Handle) {
        let quit = self.clone();
        handle.spawn_blocking(move || {
            while !quit.is_set() {
                match event::poll(KEY_POLL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        log::warn!("Keyboard input unavailable: {}", e);
                        return;
                    }
                }
                match event::read() {
                    Ok(Event::Key(key)) if is_quit_key(&key) => {
                        log::info!("Quit requested from keyboard");
                        quit.trigger();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Keyboard input unavailable: {}", e);
                        return;
                    }
                }
            }
        });
    }
}

/// What to play and how
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackParams {
    pub target: StationTarget,
    pub cache_kb: u32,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum IterationError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Stream read failed: {0}")]
    Read(#[from] StreamReadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Continue,
    /// The iteration failed and the capture stream was recreated
    Recovered,
    Quit,
}

pub struct ControlLoop {
    supervisor: PlaybackSupervisor,
    engine: AudioLevelEngine,
    stats: Box<dyn StatsProvider>,
    renderer: Box<dyn Renderer>,
    quit: QuitSignal,
    playback: PlaybackParams,
    read_seconds: f64,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: PlaybackSupervisor,
        engine: AudioLevelEngine,
        stats: Box<dyn StatsProvider>,
        renderer: Box<dyn Renderer>,
        quit: QuitSignal,
        playback: PlaybackParams,
        read_seconds: f64,
        stale_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            supervisor,
            engine,
            stats,
            renderer,
            quit,
            playback,
            read_seconds,
            stale_after,
            clock,
        }
    }

    /// Run until the quit signal is set, then stop the player
    pub fn run(&mut self) {
        log::info!("Monitoring '{}'", self.playback.target.name);
        while self.run_iteration() != IterationOutcome::Quit {}
        log::info!("Monitor stopped");
    }

    pub fn run_iteration(&mut self) -> IterationOutcome {
        let outcome = match self.step() {
            Ok(()) => IterationOutcome::Continue,
            Err(e) => {
                log::warn!("{}; recreating capture stream", e);
                self.recover();
                IterationOutcome::Recovered
            }
        };

        if self.quit.is_set() {
            self.supervisor.stop();
            return IterationOutcome::Quit;
        }
        outcome
    }

    fn step(&mut self) -> Result<(), IterationError> {
        self.stats.refresh();

        if !self.supervisor.is_alive() {
            let PlaybackParams {
                target,
                cache_kb,
                extra_args,
            } = &self.playback;
            self.supervisor.launch(target, *cache_kb, extra_args)?;
        }

        let levels = self.engine.read_levels(self.read_seconds)?;

        self.renderer.draw_levels(&levels);
        let snapshot = self.stats.snapshot();
        self.renderer.draw_stats(&StatsPanel::from_snapshot(
            snapshot.as_ref(),
            self.clock.now(),
            self.stale_after,
        ));
        if let Err(e) = self.renderer.present() {
            log::warn!("Failed to draw: {}", e);
        }
        Ok(())
    }

    fn recover(&mut self) {
        self.clock.sleep(RECOVERY_PAUSE);
        self.engine.close();
        if let Err(e) = self.engine.reopen() {
            // Stays closed; the next read fails fast and lands back here
            log::error!("Failed to reopen capture stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{params, FakeBackend};
    use crate::clock::testing::ManualClock;
    use crate::models::LevelState;
    use crate::player::testing::{FakeLauncher, FakeRegistry};
    use crate::player::{NameMatch, SessionState, SupervisorConfig};
    use crate::stats::StatsSnapshot;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<String>>>;

    struct FakeStats {
        events: Events,
        snapshot: Option<StatsSnapshot>,
    }

    impl StatsProvider for FakeStats {
        fn refresh(&self) -> bool {
            self.events.lock().unwrap().push("refresh".into());
            false
        }

        fn snapshot(&self) -> Option<StatsSnapshot> {
            self.snapshot.clone()
        }
    }

    struct FakeRenderer {
        events: Events,
        panels: Arc<Mutex<Vec<StatsPanel>>>,
    }

    impl Renderer for FakeRenderer {
        fn draw_levels(&mut self, levels: &LevelState) {
            self.events
                .lock()
                .unwrap()
                .push(format!("levels {}", levels.left.instant));
        }

        fn draw_stats(&mut self, panel: &StatsPanel) {
            self.events.lock().unwrap().push("stats".into());
            self.panels.lock().unwrap().push(panel.clone());
        }

        fn present(&mut self) -> io::Result<()> {
            self.events.lock().unwrap().push("present".into());
            Ok(())
        }
    }

    struct Harness {
        registry: FakeRegistry,
        launcher: FakeLauncher,
        backend: FakeBackend,
        clock: Arc<ManualClock>,
        events: Events,
        panels: Arc<Mutex<Vec<StatsPanel>>>,
        quit: QuitSignal,
        control: ControlLoop,
    }

    fn harness() -> Harness {
        let registry = FakeRegistry::default();
        let launcher = FakeLauncher::new(registry.clone(), 101);
        let clock = Arc::new(ManualClock::new());
        let supervisor = PlaybackSupervisor::new(
            SupervisorConfig::default(),
            Box::new(registry.clone()),
            Box::new(launcher.clone()),
            Box::new(NameMatch),
            clock.clone(),
        );

        let backend = FakeBackend::default();
        let mut engine = AudioLevelEngine::new(Box::new(backend.clone()));
        engine.open_stream(params("Loopback")).unwrap();

        let events = Events::default();
        let panels = Arc::new(Mutex::new(Vec::new()));
        let quit = QuitSignal::new();
        let control = ControlLoop::new(
            supervisor,
            engine,
            Box::new(FakeStats {
                events: events.clone(),
                snapshot: None,
            }),
            Box::new(FakeRenderer {
                events: events.clone(),
                panels: panels.clone(),
            }),
            quit.clone(),
            PlaybackParams {
                target: StationTarget::new("KXYZ", "http://127.0.0.1:8000/live"),
                cache_kb: 320,
                extra_args: vec!["-ao".into(), "alsa".into()],
            },
            0.5,
            Duration::from_secs(30),
            clock.clone(),
        );

        Harness {
            registry,
            launcher,
            backend,
            clock,
            events,
            panels,
            quit,
            control,
        }
    }

    #[test]
    fn test_first_iteration_launches_and_draws() {
        let mut h = harness();
        h.backend.push_read(Ok(vec![16384; 8]));

        assert_eq!(h.control.run_iteration(), IterationOutcome::Continue);
        assert_eq!(h.launcher.spawn_count(), 1);
        assert_eq!(
            h.launcher.last_command().unwrap().args,
            vec!["-ao", "alsa", "-cache", "320", "http://127.0.0.1:8000/live"]
        );
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["refresh", "levels 34", "stats", "present"]
        );
        assert_eq!(
            h.panels.lock().unwrap()[0].current_listeners,
            "No Listeners available"
        );
    }

    #[test]
    fn test_running_player_not_relaunched() {
        let mut h = harness();
        h.control.run_iteration();
        h.control.run_iteration();
        h.control.run_iteration();
        assert_eq!(h.launcher.spawn_count(), 1);
        assert_eq!(h.events.lock().unwrap().iter().filter(|e| *e == "refresh").count(), 3);
    }

    #[test]
    fn test_read_failure_recreates_stream_once() {
        let mut h = harness();
        h.control.run_iteration();
        assert_eq!(h.backend.opens(), 1);
        h.events.lock().unwrap().clear();

        h.backend.push_read(Err(StreamReadError::Overrun));
        assert_eq!(h.control.run_iteration(), IterationOutcome::Recovered);

        assert_eq!(h.backend.closes(), 1);
        assert_eq!(h.backend.opens(), 2);
        // The player is untouched by capture recovery
        assert!(h.registry.terminated().is_empty());
        assert_eq!(h.control.supervisor.state(), SessionState::Running);
        assert_eq!(h.launcher.spawn_count(), 1);
        // Nothing drawn for the failed read
        assert_eq!(*h.events.lock().unwrap(), vec!["refresh"]);
        assert_eq!(h.clock.sleeps().last(), Some(&RECOVERY_PAUSE));

        assert_eq!(h.control.run_iteration(), IterationOutcome::Continue);
    }

    #[test]
    fn test_failed_reopen_retries_next_iteration() {
        let mut h = harness();
        h.control.run_iteration();

        h.backend.log.lock().unwrap().fail_open = true;
        h.backend.push_read(Err(StreamReadError::Disconnected("gone".into())));
        assert_eq!(h.control.run_iteration(), IterationOutcome::Recovered);
        assert!(!h.control.engine.is_open());

        // Closed engine fails fast and recovery runs again
        h.backend.log.lock().unwrap().fail_open = false;
        assert_eq!(h.control.run_iteration(), IterationOutcome::Recovered);
        assert!(h.control.engine.is_open());
        assert_eq!(h.control.run_iteration(), IterationOutcome::Continue);
    }

    #[test]
    fn test_spawn_failure_recovers_and_retries_launch() {
        let mut h = harness();
        *h.launcher.fail.lock().unwrap() = true;
        assert_eq!(h.control.run_iteration(), IterationOutcome::Recovered);
        assert_eq!(h.control.supervisor.state(), SessionState::Stopped);

        *h.launcher.fail.lock().unwrap() = false;
        assert_eq!(h.control.run_iteration(), IterationOutcome::Continue);
        assert_eq!(h.launcher.spawn_count(), 1);
        assert_eq!(h.control.supervisor.state(), SessionState::Running);
    }

    #[test]
    fn test_quit_stops_player() {
        let mut h = harness();
        h.control.run_iteration();
        assert!(h.registry.is_running(101));

        h.quit.trigger();
        assert_eq!(h.control.run_iteration(), IterationOutcome::Quit);
        assert_eq!(h.control.supervisor.state(), SessionState::Stopped);
        assert!(!h.registry.is_running(101));
        assert!(!h.registry.is_running(102));
    }

    #[test]
    fn test_quit_during_recovery() {
        let mut h = harness();
        h.control.run_iteration();
        h.backend.push_read(Err(StreamReadError::Timeout(Duration::from_secs(1))));
        h.quit.trigger();
        assert_eq!(h.control.run_iteration(), IterationOutcome::Quit);
    }

    #[test]
    fn test_quit_keys() {
        let press = |code, modifiers| KeyEvent::new(code, modifiers);
        assert!(is_quit_key(&press(KeyCode::Esc, KeyModifiers::NONE)));
        assert!(is_quit_key(&press(KeyCode::Char('q'), KeyModifiers::NONE)));
        assert!(is_quit_key(&press(KeyCode::Char('c'), KeyModifiers::CONTROL)));

        assert!(!is_quit_key(&press(KeyCode::Char('c'), KeyModifiers::NONE)));
        assert!(!is_quit_key(&press(KeyCode::Char('q'), KeyModifiers::ALT)));
        assert!(!is_quit_key(&press(KeyCode::Enter, KeyModifiers::NONE)));

        let mut release = press(KeyCode::Esc, KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert!(!is_quit_key(&release));
    }

    #[test]
    fn test_run_returns_on_quit() {
        let mut h = harness();
        h.quit.trigger();
        h.control.run();
        assert!(h.registry.terminated().contains(&101));
    }
}
