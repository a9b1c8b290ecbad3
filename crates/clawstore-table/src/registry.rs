//! Table registry — the set of tables a flush sweep walks.
//!
//! Tables with a storage engine register themselves on open. The registry is
//! an explicit value, so a process may run several independent stores side
//! by side. Tables stay registered for the life of the registry.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::buffer::ModCounter;
use crate::config::Config;
use crate::error::ClawResult;
use crate::lock::LockManager;

/// Result of one incremental flush over one or more tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushCounts {
    /// Pending entries examined
    pub seen: usize,
    /// Entries persisted and dropped from the write-back buffer
    pub flushed: usize,
    /// Entries still pending afterwards
    pub remaining: usize,
}

impl AddAssign for FlushCounts {
    fn add_assign(&mut self, other: Self) {
        self.seen += other.seen;
        self.flushed += other.flushed;
        self.remaining += other.remaining;
    }
}

/// A table as seen by flush sweeps, with its value type erased.
pub trait FlushTarget: Send + Sync {
    fn name(&self) -> &str;

    fn pending_len(&self) -> usize;

    /// Persist pending entries whose shard lock is free.
    fn try_flush(&self, locks: &dyn LockManager) -> ClawResult<FlushCounts>;

    /// Persist every pending entry without locking and save the id counter.
    fn flush_exclusive(&self) -> ClawResult<usize>;
}

/// Registry of write-back tables sharing a configuration and mod counter.
pub struct TableRegistry {
    config: Config,
    mod_counter: Arc<ModCounter>,
    tables: RwLock<Vec<Arc<dyn FlushTarget>>>,
    total_cycles: AtomicU64,
    total_flushed: AtomicU64,
}

impl TableRegistry {
    pub fn new(config: Config) -> ClawResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            mod_counter: Arc::new(ModCounter::new()),
            tables: RwLock::new(Vec::new()),
            total_cycles: AtomicU64::new(0),
            total_flushed: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Keys that entered any write-back buffer since the last trickle cycle.
    pub fn mod_counter(&self) -> &Arc<ModCounter> {
        &self.mod_counter
    }

    pub fn register(&self, table: Arc<dyn FlushTarget>) {
        debug!(table = table.name(), "table registered for flush");
        self.tables.write().push(table);
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().iter().map(|t| t.name().to_string()).collect()
    }

    /// Pending entries across every registered table.
    pub fn pending_len(&self) -> usize {
        self.tables.read().iter().map(|t| t.pending_len()).sum()
    }

    /// Incremental flush of every registered table, safe alongside live
    /// writers. A failing table is logged and skipped; the others still flush.
    pub fn try_flush_all(&self, locks: &dyn LockManager) -> FlushCounts {
        let tables = self.snapshot();
        let mut total = FlushCounts::default();
        for table in &tables {
            match table.try_flush(locks) {
                Ok(counts) => total += counts,
                Err(e) => {
                    error!(table = table.name(), error = %e, "incremental flush failed");
                    total.remaining += table.pending_len();
                }
            }
        }
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.total_flushed.fetch_add(total.flushed as u64, Ordering::Relaxed);
        total
    }

    /// Flush everything and save every id counter. The caller guarantees
    /// that no writer is active (shutdown or checkpoint).
    pub fn flush_all_exclusive(&self) -> usize {
        let tables = self.snapshot();
        let mut flushed = 0;
        for table in &tables {
            match table.flush_exclusive() {
                Ok(n) => flushed += n,
                Err(e) => error!(table = table.name(), error = %e, "exclusive flush failed"),
            }
        }
        self.mod_counter.take();
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.total_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
        debug!(tables = tables.len(), flushed, "exclusive flush complete");
        flushed
    }

    /// Flush cycles run so far, incremental and exclusive.
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    /// Entries persisted so far across all cycles.
    pub fn total_flushed(&self) -> u64 {
        self.total_flushed.load(Ordering::Relaxed)
    }

    // Flushing calls into storage engines; never hold the list lock across it.
    fn snapshot(&self) -> Vec<Arc<dyn FlushTarget>> {
        self.tables.read().clone()
    }
}
