//! Shard lock interface and the default mutex pool.
//!
//! Tables never lock. Callers lock `table.lock_id(key)` before using any
//! `*_unsafe` accessor, and the incremental flush takes the same lock with
//! `try_lock` so it never blocks a live caller. Distinct keys may map to the
//! same shard; that only costs concurrency.

use parking_lot::Mutex;

use crate::config::Config;

trait Held {}
impl<T> Held for T {}

/// A held shard lock. Dropping it releases the lock.
pub struct ShardGuard<'a> {
    _held: Box<dyn Held + 'a>,
}

impl<'a> ShardGuard<'a> {
    /// Wrap any guard value whose drop releases the lock.
    pub fn new<G: 'a>(guard: G) -> Self {
        Self { _held: Box::new(guard) }
    }
}

/// Grants mutual exclusion per shard identifier.
pub trait LockManager: Send + Sync {
    /// Acquire without blocking; `None` if the shard is held elsewhere.
    fn try_lock(&self, lock_id: u32) -> Option<ShardGuard<'_>>;

    /// Acquire, blocking until available.
    fn lock(&self, lock_id: u32) -> ShardGuard<'_>;

    /// Acquire several shards in ascending, de-duplicated order so that two
    /// callers locking overlapping sets cannot deadlock.
    fn lock_many(&self, lock_ids: &[u32]) -> Vec<ShardGuard<'_>> {
        let mut ids = lock_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|id| self.lock(id)).collect()
    }
}

/// Fixed pool of mutexes indexed by `lock_id & mask`.
pub struct ShardLocks {
    shards: Box<[Mutex<()>]>,
    mask: u32,
}

impl ShardLocks {
    /// Create a pool of `shards` locks, rounded up to a power of two.
    pub fn new(shards: usize) -> Self {
        let count = shards.clamp(1, 1 << 30).next_power_of_two();
        let shards: Vec<Mutex<()>> = (0..count).map(|_| Mutex::new(())).collect();
        Self { shards: shards.into_boxed_slice(), mask: (count - 1) as u32 }
    }

    /// Pool sized by `Config::lock_shards`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lock_shards)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Pool slot a shard identifier resolves to. Ids that differ only above
    /// the mask share a slot, so the slot (not the id) is the unit of
    /// exclusion and of deadlock-free ordering.
    pub fn slot(&self, lock_id: u32) -> usize {
        (lock_id & self.mask) as usize
    }
}

impl LockManager for ShardLocks {
    fn try_lock(&self, lock_id: u32) -> Option<ShardGuard<'_>> {
        self.shards[self.slot(lock_id)].try_lock().map(ShardGuard::new)
    }

    fn lock(&self, lock_id: u32) -> ShardGuard<'_> {
        ShardGuard::new(self.shards[self.slot(lock_id)].lock())
    }

    fn lock_many(&self, lock_ids: &[u32]) -> Vec<ShardGuard<'_>> {
        let mut slots: Vec<usize> = lock_ids.iter().map(|&id| self.slot(id)).collect();
        slots.sort_unstable();
        slots.dedup();
        slots.into_iter().map(|s| ShardGuard::new(self.shards[s].lock())).collect()
    }
}
