//! Command-line interface for the stream monitor
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// Stream Monitor - live VU meter, player supervisor and Icecast stats
#[derive(Parser, Debug)]
#[command(name = "stream-monitor")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (defaults to ~/.config/stream-monitor/config.json)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging, same as -vv
    #[arg(long)]
    pub debug: bool,

    /// Print the available capture devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    ///
    /// `config_debug` is the config file's `logging.debug` switch.
    pub fn log_level(&self, config_debug: bool) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }
        let level = match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        if self.debug || config_debug {
            level.max(LevelFilter::Debug)
        } else {
            level
        }
    }
}

/// Initialize the logging system based on CLI arguments
///
/// With `log_file` set, records are appended there instead of stderr.
pub fn init_logging(args: &Args, config_debug: bool, log_file: Option<&Path>) -> io::Result<()> {
    let mut builder = env_logger::Builder::new();

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // Dependencies stay at warn unless asked for explicitly
    builder.filter_level(LevelFilter::Warn);

    let level = args.log_level(config_debug);
    builder.filter_module("stream_monitor", level);

    // HTTP and PipeWire internals only at -vvvv
    if args.verbose >= 4 {
        for module in ["reqwest", "hyper", "pipewire"] {
            builder.filter_module(module, level);
        }
    }

    builder.format_timestamp_millis().init();
    Ok(())
}
