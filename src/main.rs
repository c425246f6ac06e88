//! Stream Monitor - a kiosk display for a live Icecast stream
//!
//! Plays the station through an external player, shows a stereo VU meter
//! of the captured output and the server's listener statistics.

mod audio;
mod cli;
mod clock;
mod config;
mod control;
mod models;
mod player;
mod render;
mod stats;
mod tokio_runtime;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io;
use std::sync::Arc;

use audio::{AudioLevelEngine, PipeWireBackend};
use clock::{Clock, SystemClock};
use config::Config;
use control::{ControlLoop, PlaybackParams, QuitSignal};
use player::{ChildLauncher, PlaybackSupervisor, SystemProcessRegistry};
use render::{RawModeGuard, TerminalRenderer};
use stats::{DisabledStats, IcecastClient, StatsCollector, StatsProvider};

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    let (config, config_path) =
        Config::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    cli::init_logging(&args, config.logging.debug, config.logging.file.as_deref())
        .context("Failed to open log file")?;
    match &config_path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    if args.list_devices {
        return print_devices();
    }

    info!("Starting stream monitor");

    // Global Tokio runtime for stats requests and signal handling
    tokio_runtime::init().context("Failed to start async runtime")?;
    let handle = tokio_runtime::handle().context("Async runtime not initialized")?;

    let quit = QuitSignal::new();
    quit.install_handlers(&handle)
        .context("Failed to install signal handlers")?;

    // Capture problems at startup are fatal; later ones are recovered by the loop
    let mut engine = AudioLevelEngine::new(Box::new(PipeWireBackend::new()));
    engine
        .open_stream(config.stream_params())
        .context("Failed to open capture device")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let supervisor = PlaybackSupervisor::new(
        config.supervisor_config(),
        Box::new(SystemProcessRegistry::new()),
        Box::new(ChildLauncher),
        config.player.ownership.build(),
        clock.clone(),
    );

    let stats: Box<dyn StatsProvider> = if config.icecast.enabled {
        let icecast = &config.icecast;
        let client = IcecastClient::new(
            &icecast.server,
            icecast.port,
            icecast.user.clone(),
            icecast.password.clone(),
            icecast.timeout(),
        )
        .context("Failed to create stats client")?
        .with_preferred_mount(icecast.mount_path());
        Box::new(StatsCollector::new(client, handle.clone()))
    } else {
        info!("Icecast stats disabled");
        Box::new(DisabledStats)
    };

    let target = config.station_target();
    let _raw_mode = RawModeGuard::enable().context("Failed to initialize terminal")?;
    let renderer = TerminalRenderer::new(io::stdout(), target.name.clone())
        .context("Failed to initialize terminal")?;
    quit.watch_keys(&handle);

    let mut control = ControlLoop::new(
        supervisor,
        engine,
        stats,
        Box::new(renderer),
        quit,
        PlaybackParams {
            target,
            cache_kb: config.player.cache_kb,
            extra_args: config.player.extra_args.clone(),
        },
        config.capture.read_seconds,
        config.icecast.stale_after(),
        clock,
    );
    control.run();

    Ok(())
}

fn print_devices() -> Result<()> {
    let devices = audio::list_capture_devices().context("Failed to list capture devices")?;
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        let kind = if device.is_monitor { "monitor" } else { "input" };
        println!(
            "Input Device id {} - {} [{}] ({})",
            device.id, device.description, device.name, kind
        );
    }
    Ok(())
}
