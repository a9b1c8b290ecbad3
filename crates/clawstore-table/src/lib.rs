//! ClawStore Table — Write-Back Cached Tables over a Pluggable Storage Engine
//!
//! Integer-keyed tables that serve reads and writes from memory while a
//! background trickle thread makes every change durable in the storage
//! engine behind them.
//!
//! # Architecture
//!
//! - **Read path**: bounded LRU read cache, then write-back buffer, then storage
//! - **Write path**: read cache + write-back buffer; storage catches up on flush
//! - **Trickle engine**: incremental flush that skips keys locked by live work
//! - **Rollback**: safe accessors register undo actions with the caller's
//!   transaction so an abort restores the cached state
//!
//! # Locking
//!
//! Tables take no locks of their own. Callers lock `table.lock_id(key)` in a
//! shared `LockManager` before touching a key; the trickle engine uses the
//! same manager with `try_lock` and never waits on a caller.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod record;
pub mod registry;
pub mod safe;
pub mod storage;
pub mod table;
pub mod trickle;
pub mod txn;

// Re-export key types for convenience
pub use buffer::{ModCounter, Pending, WriteBuffer};
pub use cache::{CacheStats, ReadCache};
pub use config::Config;
pub use error::{ClawError, ClawResult};
pub use lock::{LockManager, ShardGuard, ShardLocks};
pub use record::{ErasedRecord, Field, RecordRef, SaveState};
pub use registry::{FlushCounts, FlushTarget, TableRegistry};
pub use safe::SafeRecord;
pub use storage::{MemoryStorage, Storage};
pub use table::{AutoId, Table, TableOptions};
pub use trickle::{start_trickle, TrickleHandle};
pub use txn::{Registered, SoftTransaction, TxContext, UndoAction};
