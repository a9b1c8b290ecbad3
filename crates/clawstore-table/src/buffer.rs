//! Write-back buffer — pending mutations not yet flushed to storage.
//!
//! The buffer is the single source of truth for what must eventually reach
//! the storage engine. It never overflows and only shrinks when a flush
//! persists an entry. Deletions are kept as explicit tombstones because the
//! read cache cannot tell "never loaded" apart from "deleted".

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::record::RecordRef;

/// A pending write for one key.
pub enum Pending<V> {
    /// New or modified record
    Present(RecordRef<V>),
    /// Deleted; the deletion is not yet durable
    Tombstone,
}

impl<V> Pending<V> {
    /// Identity comparison: tombstones match each other, records match by instance.
    pub fn same(&self, other: &Pending<V>) -> bool {
        match (self, other) {
            (Pending::Tombstone, Pending::Tombstone) => true,
            (Pending::Present(a), Pending::Present(b)) => a.same(b),
            _ => false,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Pending::Tombstone)
    }

    pub fn record(&self) -> Option<&RecordRef<V>> {
        match self {
            Pending::Present(r) => Some(r),
            Pending::Tombstone => None,
        }
    }
}

impl<V> Clone for Pending<V> {
    fn clone(&self) -> Self {
        match self {
            Pending::Present(r) => Pending::Present(r.clone()),
            Pending::Tombstone => Pending::Tombstone,
        }
    }
}

/// Counts keys that entered a write-back buffer since the last flush cycle.
///
/// One counter is shared by every table of a registry; the trickle engine
/// reads it to decide whether a cycle is due before its cadence elapses.
#[derive(Debug, Default)]
pub struct ModCounter {
    count: AtomicU64,
}

impl ModCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Read and reset.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

/// Returned by `WriteBuffer::mark` when a different instance is already pending.
pub(crate) struct Mismatch;

/// Unbounded map of pending writes.
pub struct WriteBuffer<V> {
    entries: Mutex<HashMap<u64, Pending<V>>>,
}

impl<V> WriteBuffer<V> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: u64) -> Option<Pending<V>> {
        self.entries.lock().get(&key).cloned()
    }

    /// Store a record for `key`, returning the entry it replaced.
    pub fn put(&self, key: u64, record: RecordRef<V>) -> Option<Pending<V>> {
        self.entries.lock().insert(key, Pending::Present(record))
    }

    /// Store a tombstone for `key`, returning the entry it replaced.
    pub fn put_tombstone(&self, key: u64) -> Option<Pending<V>> {
        self.entries.lock().insert(key, Pending::Tombstone)
    }

    /// Store `record` for `key` unless another instance or a tombstone is pending.
    /// Returns true when the key was not pending before.
    pub(crate) fn mark(&self, key: u64, record: &RecordRef<V>) -> Result<bool, Mismatch> {
        let mut entries = self.entries.lock();
        match entries.entry(key) {
            Entry::Occupied(e) => match e.get() {
                Pending::Present(r) if r.same(record) => Ok(false),
                _ => Err(Mismatch),
            },
            Entry::Vacant(e) => {
                e.insert(Pending::Present(record.clone()));
                Ok(true)
            }
        }
    }

    /// Remove the entry for `key` only if it is identical to `expected`.
    ///
    /// A flush calls this after persisting `expected`; if a writer replaced
    /// the entry in the meantime, the newer entry is left for the next round.
    pub fn remove_if(&self, key: u64, expected: &Pending<V>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(current) if current.same(expected) => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Put back `prior` (or nothing) for `key`, provided the slot still holds
    /// `replaced`. Used when undoing a put.
    pub(crate) fn restore(&self, key: u64, prior: Option<Pending<V>>, replaced: &RecordRef<V>) -> bool {
        let mut entries = self.entries.lock();
        let holds_replaced = matches!(entries.get(&key), Some(Pending::Present(r)) if r.same(replaced));
        if !holds_replaced {
            return false;
        }
        match prior {
            Some(p) => { entries.insert(key, p); }
            None => { entries.remove(&key); }
        }
        true
    }

    /// Snapshot of the pending keys.
    pub fn keys(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    /// Snapshot of all pending entries.
    pub fn entries(&self) -> Vec<(u64, Pending<V>)> {
        self.entries.lock().iter().map(|(k, p)| (*k, p.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V> Default for WriteBuffer<V> {
    fn default() -> Self { Self::new() }
}
