//! Bounded read cache.
//!
//! Holds recently accessed records, including ones not yet durable. The cache
//! grows to a high watermark (`capacity * 3 / 2`) and is then swept back down
//! to `capacity`, discarding the least recently used entries. A sweep only
//! drops the cache's own handle: a record that is also pending in the
//! write-back buffer stays reachable through the buffer.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::record::RecordRef;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Slot<V> {
    record: RecordRef<V>,
    last_used: u64,
}

struct Inner<V> {
    map: HashMap<u64, Slot<V>>,
    clock: u64,
}

impl<V> Inner<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Fixed-capacity LRU map from key to record.
pub struct ReadCache<V> {
    capacity: usize,
    high_water: usize,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> ReadCache<V> {
    /// Create a cache that keeps at least `capacity` most recent records.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let high_water = capacity + capacity / 2;
        Self {
            capacity,
            high_water,
            inner: Mutex::new(Inner { map: HashMap::with_capacity(high_water + 1), clock: 0 }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a record and mark it most recently used.
    pub fn get(&self, key: u64) -> Option<RecordRef<V>> {
        let mut inner = self.inner.lock();
        let now = inner.tick();
        match inner.map.get_mut(&key) {
            Some(slot) => {
                slot.last_used = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.record.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up a record without touching recency or statistics.
    pub fn peek(&self, key: u64) -> Option<RecordRef<V>> {
        self.inner.lock().map.get(&key).map(|slot| slot.record.clone())
    }

    /// Insert or replace, returning the previous record for `key`.
    pub fn put(&self, key: u64, record: RecordRef<V>) -> Option<RecordRef<V>> {
        let mut inner = self.inner.lock();
        let now = inner.tick();
        let old = inner.map.insert(key, Slot { record, last_used: now }).map(|slot| slot.record);
        if inner.map.len() > self.high_water {
            self.sweep(&mut inner);
        }
        old
    }

    /// Remove `key`, returning the record it held.
    pub fn remove(&self, key: u64) -> Option<RecordRef<V>> {
        self.inner.lock().map.remove(&key).map(|slot| slot.record)
    }

    /// Snapshot of the cached keys, in no particular order.
    pub fn keys(&self) -> Vec<u64> {
        self.inner.lock().map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Trim down to `capacity`, oldest first.
    fn sweep(&self, inner: &mut Inner<V>) {
        let excess = inner.map.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut stamps: Vec<(u64, u64)> = inner.map.iter()
            .map(|(k, slot)| (slot.last_used, *k))
            .collect();
        stamps.select_nth_unstable(excess - 1);
        for &(_, key) in &stamps[..excess] {
            inner.map.remove(&key);
        }
        self.evictions.fetch_add(excess as u64, Ordering::Relaxed);
    }
}
