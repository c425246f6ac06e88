//! Listener statistics
//!
//! A [`StatsSource`] fetches a fresh [`StatsSnapshot`] from the streaming
//! server. [`StatsCollector`] runs those fetches in the background, at most
//! one at a time, and keeps the last good snapshot for display. Failed
//! refreshes are logged and otherwise ignored; the panel simply shows the
//! last known values.

mod icecast;

pub use icecast::IcecastClient;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::clock::elapsed_between;
use crate::tokio_runtime::TaskGuard;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Failed to reach stats server: {0}")]
    Connection(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Error parsing stats XML: {0}")]
    Parse(String),
}

/// A client connected to a mount
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub connected_secs: Option<u64>,
}

/// Per-mount details; every field may be missing from the server's answer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountStats {
    pub mount: String,
    pub server_description: Option<String>,
    pub stream_start: Option<String>,
    pub listener_peak: Option<u32>,
    pub slow_listeners: Option<u32>,
    pub listeners: Vec<ListenerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub listeners: Option<u32>,
    pub server_start: Option<String>,
    pub mounts: Vec<MountStats>,
    pub fetched_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        elapsed_between(self.fetched_at, now) > max_age
    }
}

/// Something that can fetch statistics
pub trait StatsSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<StatsSnapshot, StatsError>> + Send;
}

/// What the control loop sees of the statistics machinery
pub trait StatsProvider {
    /// Start a refresh unless one is already running; returns whether one started
    fn refresh(&self) -> bool;

    /// Last successfully fetched snapshot
    fn snapshot(&self) -> Option<StatsSnapshot>;
}

/// Background refresher keeping the latest snapshot
pub struct StatsCollector<S: StatsSource> {
    source: Arc<S>,
    handle: Handle,
    guard: TaskGuard,
    latest: Arc<Mutex<Option<StatsSnapshot>>>,
}

impl<S: StatsSource> StatsCollector<S> {
    pub fn new(source: S, handle: Handle) -> Self {
        Self {
            source: Arc::new(source),
            handle,
            guard: TaskGuard::new(),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.guard.is_busy()
    }
}

impl<S: StatsSource> StatsProvider for StatsCollector<S> {
    fn refresh(&self) -> bool {
        let source = self.source.clone();
        let latest = self.latest.clone();

        self.guard.spawn(&self.handle, async move {
            match source.fetch().await {
                Ok(snapshot) => {
                    log::trace!("Stats refreshed: {:?} listeners", snapshot.listeners);
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                }
                Err(e) => log::warn!("Stats refresh failed: {}", e),
            }
        })
    }

    fn snapshot(&self) -> Option<StatsSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Provider used when stats polling is turned off
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStats;

impl StatsProvider for DisabledStats {
    fn refresh(&self) -> bool {
        false
    }

    fn snapshot(&self) -> Option<StatsSnapshot> {
        None
    }
}

/// Display text for the stats panel, with placeholders for missing data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsPanel {
    pub title: String,
    pub server_start: String,
    pub stream_start: String,
    pub current_listeners: String,
    pub peak_listeners: String,
    pub slow_listeners: String,
    pub stale: bool,
}

impl StatsPanel {
    pub fn from_snapshot(snapshot: Option<&StatsSnapshot>, now: DateTime<Utc>, max_age: Duration) -> Self {
        let mount = snapshot.and_then(|s| s.mounts.first());

        fn or_placeholder<T: ToString>(value: Option<T>, what: &str) -> String {
            value
                .map(|v| v.to_string())
                .unwrap_or_else(|| format!("No {} available", what))
        }

        Self {
            title: or_placeholder(
                mount.and_then(|m| m.server_description.clone()),
                "description",
            ),
            server_start: or_placeholder(
                snapshot.and_then(|s| s.server_start.clone()),
                "Server Start",
            ),
            stream_start: or_placeholder(
                mount.and_then(|m| m.stream_start.clone()),
                "Stream Start",
            ),
            current_listeners: or_placeholder(snapshot.and_then(|s| s.listeners), "Listeners"),
            peak_listeners: or_placeholder(mount.and_then(|m| m.listener_peak), "Listener Peak"),
            slow_listeners: or_placeholder(mount.and_then(|m| m.slow_listeners), "Slow Listeners"),
            stale: snapshot.map_or(true, |s| s.is_stale(now, max_age)),
        }
    }
}
