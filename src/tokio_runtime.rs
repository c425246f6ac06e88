//! Global Tokio runtime for background work
//!
//! The control loop itself is synchronous. HTTP stats refreshes and signal
//! handling need Tokio, so a small lazily-initialized runtime lives here,
//! along with the single-slot guard that keeps background refreshes from
//! piling up.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Handle, Runtime};

static TOKIO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the global Tokio runtime. Call this during startup.
pub fn init() -> io::Result<()> {
    if TOKIO_RUNTIME.get().is_some() {
        return Ok(());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("stream-monitor-io")
        .enable_all()
        .build()?;
    // A concurrent init may have won; the spare runtime is dropped
    let _ = TOKIO_RUNTIME.set(runtime);
    Ok(())
}

/// Get the global Tokio runtime handle, if initialized
pub fn handle() -> Option<Handle> {
    TOKIO_RUNTIME.get().map(|runtime| runtime.handle().clone())
}

/// At-most-one-in-flight guard for a kind of background task
///
/// Requests made while a task holds the permit are dropped, not queued.
#[derive(Clone, Default)]
pub struct TaskGuard {
    in_flight: Arc<AtomicBool>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the slot; `None` if a task is already running
    pub fn try_acquire(&self) -> Option<TaskPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TaskPermit {
                in_flight: self.in_flight.clone(),
            })
    }

    /// Spawn `future` on `handle` unless one is already in flight
    ///
    /// Returns whether the task was dispatched. The slot is released when
    /// the task finishes, including when it panics.
    pub fn spawn<F>(&self, handle: &Handle, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(permit) = self.try_acquire() else {
            return false;
        };
        handle.spawn(async move {
            let _permit = permit;
            future.await;
        });
        true
    }
}

/// Releases the owning [`TaskGuard`] slot on drop
pub struct TaskPermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
