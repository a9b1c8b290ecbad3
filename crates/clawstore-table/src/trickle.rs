//! Trickle Engine — background incremental flush of every registered table
//!
//! The trickle thread wakes when the configured cadence elapses or when the
//! registry's modification counter crosses `flush_mod_threshold`, whichever
//! comes first, and runs one `try_flush_all` sweep. Entries whose shard lock
//! is held by a live transaction are skipped and retried on the next wake.
//!
//! The trickle engine never runs the exclusive flush and never persists the
//! auto-id counters; that is left to the owner at shutdown, once writers
//! have stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ClawError, ClawResult};
use crate::lock::LockManager;
use crate::registry::TableRegistry;

/// Longest sleep between shutdown and threshold checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to a running trickle background thread.
/// Dropping this handle signals the thread to stop.
pub struct TrickleHandle {
    /// Signal the background thread to stop
    shutdown: Arc<AtomicBool>,
    /// Background thread join handle
    thread: Option<thread::JoinHandle<()>>,
}

impl TrickleHandle {
    /// Request graceful shutdown and wait for the final sweep to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Check if the trickle thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TrickleHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the trickle background thread over `registry`, taking shard locks
/// from `locks` (the same manager the application locks through).
pub fn start_trickle(
    registry: Arc<TableRegistry>,
    locks: Arc<dyn LockManager>,
) -> ClawResult<TrickleHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("clawstore-trickle".to_string())
        .spawn(move || trickle_loop(&registry, locks.as_ref(), &shutdown_clone))
        .map_err(|e| ClawError::Io {
            kind: e.kind(),
            message: format!("Failed to spawn trickle thread: {}", e),
        })?;

    Ok(TrickleHandle {
        shutdown,
        thread: Some(thread),
    })
}

/// Main trickle loop — runs on the background thread.
fn trickle_loop(registry: &TableRegistry, locks: &dyn LockManager, shutdown: &AtomicBool) {
    let config = registry.config();
    let cadence = config.flush_cadence;
    let threshold = config.flush_mod_threshold;
    let poll = cadence.min(POLL_INTERVAL);
    info!(?cadence, threshold, tables = registry.len(), "trickle started");

    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time && registry.mod_counter().get() < threshold {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(poll);
        }

        let stopping = shutdown.load(Ordering::Acquire);
        run_cycle(registry, locks);
        if stopping {
            info!(pending = registry.pending_len(), "trickle stopped");
            return;
        }
    }
}

/// One sweep: reset the modification counter, then flush what can be locked.
fn run_cycle(registry: &TableRegistry, locks: &dyn LockManager) {
    let mods = registry.mod_counter().take();
    let counts = registry.try_flush_all(locks);
    if counts.seen > 0 {
        debug!(mods, seen = counts.seen, flushed = counts.flushed,
               remaining = counts.remaining, "trickle cycle");
    }
}
