//! Integer-keyed table — read cache + write-back buffer over a storage engine.
//!
//! **Read path**: read cache, then write-back buffer, then storage
//! **Write path**: read cache + write-back buffer, durable on the next flush
//! **Locking**: none inside; every `*_unsafe` accessor, `modify` and the
//! `get_modified` shortcut require the caller to hold `lock_id(key)`
//!
//! A table without storage is memory-only: it has no write-back buffer and
//! records evicted from its read cache are gone.

use std::ops::RangeBounds;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::buffer::{ModCounter, Pending, WriteBuffer};
use crate::cache::{CacheStats, ReadCache};
use crate::config::validate_auto_id;
use crate::error::{ClawError, ClawResult};
use crate::lock::LockManager;
use crate::record::{RecordRef, SaveState};
use crate::registry::{FlushCounts, FlushTarget, TableRegistry};
use crate::storage::Storage;

/// Multiplier spreading lock seeds across the shard space.
const LOCK_SEED_MIX: u32 = 0x9e37_79b1;

/// Per-table creation options.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Numeric table id, used as lock seed when no lock name is given
    pub id: u32,
    /// Table name, used in logs and errors
    pub name: String,
    /// Lock group name; tables sharing it share shard seeds
    pub lock_name: Option<String>,
    /// Read cache capacity, overriding `Config::read_cache_capacity`
    pub cache_capacity: Option<usize>,
}

impl TableOptions {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), lock_name: None, cache_capacity: None }
    }

    pub fn lock_name(mut self, lock_name: impl Into<String>) -> Self {
        self.lock_name = Some(lock_name.into());
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }
}

/// Auto-id layout: `id = (counter << low_bits) + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoId {
    pub low_bits: u32,
    pub offset: u64,
}

/// Storage engine plus the buffer of writes it has not seen yet.
struct Backing<V> {
    storage: Arc<dyn Storage<V>>,
    pending: WriteBuffer<V>,
}

/// Write-back cached table keyed by `u64`.
pub struct Table<V> {
    id: u32,
    pub(crate) name: Arc<str>,
    cache: ReadCache<V>,
    backing: Option<Backing<V>>,
    /// Highest counter value handed out (or seeded from storage)
    id_counter: AtomicU64,
    lock_seed: u32,
    auto_id: OnceLock<AutoId>,
    default_auto_id: AutoId,
    mod_counter: Arc<ModCounter>,
}

impl<V: Send + Sync + 'static> Table<V> {
    /// Create a table. With `storage`, the auto-id counter is seeded from the
    /// engine and the table joins `registry` flush sweeps; without it the
    /// table is memory-only.
    pub fn open(
        registry: &TableRegistry,
        options: TableOptions,
        storage: Option<Arc<dyn Storage<V>>>,
    ) -> ClawResult<Arc<Self>> {
        let config = registry.config();
        let capacity = options.cache_capacity.unwrap_or(config.read_cache_capacity);
        let seeded = match &storage {
            Some(sto) => sto.id_counter()?,
            None => 0,
        };

        let table = Arc::new(Self {
            id: options.id,
            name: Arc::from(options.name.as_str()),
            cache: ReadCache::new(capacity),
            backing: storage.map(|storage| Backing { storage, pending: WriteBuffer::new() }),
            id_counter: AtomicU64::new(seeded),
            lock_seed: lock_seed(options.id, options.lock_name.as_deref()),
            auto_id: OnceLock::new(),
            default_auto_id: AutoId { low_bits: config.auto_id_low_bits, offset: config.auto_id_offset },
            mod_counter: Arc::clone(registry.mod_counter()),
        });

        if table.backing.is_some() {
            registry.register(Arc::clone(&table) as Arc<dyn FlushTarget>);
        }
        info!(table = %table.name, id = table.id, capacity, id_counter = seeded,
              memory_only = table.backing.is_none(), "table opened");
        Ok(table)
    }
}

impl<V> Table<V> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_memory_only(&self) -> bool {
        self.backing.is_none()
    }

    /// Shard lock id guarding `key`.
    pub fn lock_id(&self, key: u64) -> u32 {
        self.lock_seed ^ (key as u32 ^ (key >> 32) as u32)
    }

    /// Number of writes waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.pending.len())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Last counter value handed out by the auto-id allocator.
    pub fn id_counter(&self) -> u64 {
        self.id_counter.load(Ordering::SeqCst)
    }

    /// Active auto-id layout.
    pub fn auto_id(&self) -> AutoId {
        self.auto_id.get().copied().unwrap_or(self.default_auto_id)
    }

    /// Fix the auto-id layout for this table.
    ///
    /// Allowed once, before the first id is generated. Tables writing into one
    /// logical id space from several processes give each a distinct `offset`.
    pub fn set_auto_id(&self, low_bits: u32, offset: u64) -> ClawResult<()> {
        validate_auto_id(low_bits, offset)?;
        self.auto_id
            .set(AutoId { low_bits, offset })
            .map_err(|_| ClawError::AutoIdLocked { table: self.name.to_string() })
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Fetch the record for `key`, caching it.
    pub fn get_unsafe(&self, key: u64) -> ClawResult<Option<RecordRef<V>>> {
        if let Some(r) = self.cache.get(key) {
            return Ok(Some(r));
        }
        let Some(backing) = &self.backing else { return Ok(None) };
        match backing.pending.get(key) {
            Some(Pending::Present(r)) => {
                self.cache.put(key, r.clone());
                return Ok(Some(r));
            }
            Some(Pending::Tombstone) => return Ok(None),
            None => {}
        }
        match backing.storage.get(key)? {
            Some(v) => {
                let r = RecordRef::loaded(v);
                self.cache.put(key, r.clone());
                Ok(Some(r))
            }
            None => Ok(None),
        }
    }

    /// `get_unsafe` followed by `modify`.
    pub fn get_modified(&self, key: u64) -> ClawResult<Option<RecordRef<V>>> {
        let r = self.get_unsafe(key)?;
        if let Some(r) = &r {
            self.modify(key, r)?;
        }
        Ok(r)
    }

    /// Fetch the record for `key` without adding it to the read cache.
    ///
    /// A record loaded from storage this way is a fresh unattached instance;
    /// fetching the same key twice this way in one transaction and modifying
    /// both copies makes the second `modify` fail.
    pub fn get_no_cache_unsafe(&self, key: u64) -> ClawResult<Option<RecordRef<V>>> {
        if let Some(r) = self.cache.peek(key) {
            return Ok(Some(r));
        }
        let Some(backing) = &self.backing else { return Ok(None) };
        match backing.pending.get(key) {
            Some(Pending::Present(r)) => Ok(Some(r)),
            Some(Pending::Tombstone) => Ok(None),
            None => Ok(backing.storage.get(key)?.map(RecordRef::new)),
        }
    }

    /// Fetch the record for `key` from the read cache or write-back buffer only.
    pub fn get_cache_unsafe(&self, key: u64) -> Option<RecordRef<V>> {
        if let Some(r) = self.cache.get(key) {
            return Some(r);
        }
        self.backing.as_ref()?.pending.get(key)?.record().cloned()
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Mark a fetched record as modified so the next flush persists it.
    ///
    /// `record` must be the instance a read accessor returned for `key`.
    /// Any other instance, whether the key is cached or pending, fails with
    /// `UnmatchedModify` and leaves the buffer unchanged.
    pub fn modify(&self, key: u64, record: &RecordRef<V>) -> ClawResult<()> {
        if self.cache.peek(key).is_some_and(|c| !c.same(record)) {
            return Err(ClawError::UnmatchedModify { table: self.name.to_string(), key });
        }
        if let Some(backing) = &self.backing {
            match backing.pending.mark(key, record) {
                Ok(true) => self.mod_counter.increment(),
                Ok(false) => {}
                Err(_) => {
                    return Err(ClawError::UnmatchedModify { table: self.name.to_string(), key });
                }
            }
        }
        record.set_save_state(SaveState::Dirty);
        Ok(())
    }

    /// Store `value` under `key`, returning the new record.
    pub fn put_unsafe(&self, key: u64, value: V) -> ClawResult<RecordRef<V>> {
        let record = RecordRef::new(value);
        self.put_record_unsafe(key, record.clone())?;
        Ok(record)
    }

    /// Store `record` under `key`.
    ///
    /// Putting the record `key` already resolves to is the same as `modify`.
    /// A record attached anywhere else fails with `SharedRecord`.
    pub fn put_record_unsafe(&self, key: u64, record: RecordRef<V>) -> ClawResult<()> {
        if self.holds(key, &record) {
            return self.modify(key, &record);
        }
        if record.is_stored() {
            return Err(ClawError::SharedRecord { table: self.name.to_string(), key });
        }
        if let Some(backing) = &self.backing {
            if backing.pending.put(key, record.clone()).is_none() {
                self.mod_counter.increment();
            }
        }
        record.set_save_state(SaveState::Dirty);
        self.cache.put(key, record);
        Ok(())
    }

    /// Store `value` under a freshly allocated id.
    pub fn insert_unsafe(&self, value: V) -> ClawResult<(u64, RecordRef<V>)> {
        let record = RecordRef::new(value);
        let key = self.insert_record_unsafe(record.clone())?;
        Ok((key, record))
    }

    pub fn insert_default_unsafe(&self) -> ClawResult<(u64, RecordRef<V>)>
    where
        V: Default,
    {
        self.insert_unsafe(V::default())
    }

    /// Store `record` under a freshly allocated id. No lock is needed: the id
    /// is new and nobody else can reference it yet.
    pub fn insert_record_unsafe(&self, record: RecordRef<V>) -> ClawResult<u64> {
        if record.is_stored() {
            return Err(ClawError::SharedRecord { table: self.name.to_string(), key: 0 });
        }
        let key = self.next_id()?;
        record.set_save_state(SaveState::Dirty);
        if let Some(backing) = &self.backing {
            if backing.pending.put(key, record.clone()).is_none() {
                self.mod_counter.increment();
            }
        }
        self.cache.put(key, record);
        Ok(key)
    }

    /// Delete `key`. The deletion reaches storage on the next flush.
    pub fn remove_unsafe(&self, key: u64) {
        let cached = self.cache.remove(key);
        let buffered = match &self.backing {
            Some(backing) => {
                let old = backing.pending.put_tombstone(key);
                if old.is_none() {
                    self.mod_counter.increment();
                }
                old.and_then(|p| p.record().cloned())
            }
            None => None,
        };
        // The removed instance is free to be stored again
        for r in cached.iter().chain(buffered.iter()) {
            r.set_save_state(SaveState::Clean);
        }
    }

    /// True when `key` already resolves to this very instance.
    pub(crate) fn holds(&self, key: u64, record: &RecordRef<V>) -> bool {
        self.cache.peek(key).is_some_and(|c| c.same(record))
            || self.pending_entry(key).is_some_and(|p| p.record().is_some_and(|r| r.same(record)))
    }

    pub(crate) fn cache_peek(&self, key: u64) -> Option<RecordRef<V>> {
        self.cache.peek(key)
    }

    pub(crate) fn pending_entry(&self, key: u64) -> Option<Pending<V>> {
        self.backing.as_ref()?.pending.get(key)
    }

    /// Put back the cache and buffer slots captured before `replaced` was
    /// stored under `key`. Slots that no longer hold `replaced` are left alone.
    pub(crate) fn restore_slot(
        &self,
        key: u64,
        replaced: &RecordRef<V>,
        prior_cached: Option<RecordRef<V>>,
        prior_pending: Option<Pending<V>>,
    ) {
        if let Some(backing) = &self.backing {
            backing.pending.restore(key, prior_pending, replaced);
        }
        if self.cache.peek(key).is_some_and(|c| c.same(replaced)) {
            match prior_cached {
                Some(r) => {
                    self.cache.put(key, r);
                }
                None => {
                    self.cache.remove(key);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Auto-id
    // ---------------------------------------------------------------------

    /// Allocate a key no other record resolves to.
    ///
    /// The counter is advanced before the key is returned, so a crash between
    /// allocation and flush can leave gaps but never hand out a key twice.
    pub fn next_id(&self) -> ClawResult<u64> {
        let layout = *self.auto_id.get_or_init(|| self.default_auto_id);
        loop {
            let n = self.id_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if n == 0 || n.leading_zeros() < layout.low_bits {
                return Err(ClawError::IdSpaceExhausted { table: self.name.to_string() });
            }
            let key = (n << layout.low_bits)
                .checked_add(layout.offset)
                .ok_or_else(|| ClawError::IdSpaceExhausted { table: self.name.to_string() })?;
            if self.get_no_cache_unsafe(key)?.is_none() {
                return Ok(key);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------------

    /// Visit the keys currently in the read cache, unordered. Returns false
    /// if the visitor stopped early. Lock each key before fetching it.
    pub fn walk_cache(&self, mut visitor: impl FnMut(u64) -> bool) -> bool {
        self.cache.keys().into_iter().all(|k| visitor(k))
    }

    /// Visit stored keys in `range` in key order (descending when `reverse`).
    ///
    /// Walks storage, so writes not yet flushed are not visited. Memory-only
    /// tables fall back to `walk_cache`.
    pub fn walk(
        &self,
        range: impl RangeBounds<u64>,
        reverse: bool,
        mut visitor: impl FnMut(u64) -> bool,
    ) -> ClawResult<bool> {
        match &self.backing {
            Some(backing) => backing.storage.walk(
                range.start_bound().cloned(),
                range.end_bound().cloned(),
                reverse,
                &mut visitor,
            ),
            None => Ok(self.walk_cache(visitor)),
        }
    }

    /// Walk every stored key in ascending order.
    pub fn walk_all(&self, visitor: impl FnMut(u64) -> bool) -> ClawResult<bool> {
        self.walk(.., false, visitor)
    }

    // ---------------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------------

    /// Persist every pending entry whose shard lock is free right now.
    ///
    /// Entries whose lock is busy, or whose write fails, stay pending for the
    /// next sweep. An entry replaced while being persisted also stays.
    pub fn try_flush(&self, locks: &dyn LockManager) -> FlushCounts {
        let Some(backing) = &self.backing else { return FlushCounts::default() };
        let keys = backing.pending.keys();
        let seen = keys.len();
        let mut flushed = 0;

        for key in keys {
            let Some(_guard) = locks.try_lock(self.lock_id(key)) else { continue };
            let Some(entry) = backing.pending.get(key) else { continue };
            if self.persist(backing, key, &entry).is_ok() && backing.pending.remove_if(key, &entry) {
                flushed += 1;
            }
        }

        FlushCounts { seen, flushed, remaining: backing.pending.len() }
    }

    /// Persist every pending entry without locking, then save the auto-id
    /// counter. The caller guarantees no writer runs concurrently.
    pub fn flush_exclusive(&self) -> ClawResult<usize> {
        let Some(backing) = &self.backing else { return Ok(0) };
        let mut flushed = 0;
        for (key, entry) in backing.pending.entries() {
            if self.persist(backing, key, &entry).is_ok() {
                backing.pending.remove_if(key, &entry);
                flushed += 1;
            }
        }
        backing.storage.set_id_counter(self.id_counter())?;
        Ok(flushed)
    }

    fn persist(&self, backing: &Backing<V>, key: u64, entry: &Pending<V>) -> ClawResult<()> {
        let result = match entry {
            Pending::Tombstone => backing.storage.remove(key),
            Pending::Present(r) => {
                let written = backing.storage.put(key, &r.read());
                if written.is_ok() {
                    r.set_save_state(SaveState::Persisted);
                }
                written
            }
        };
        if let Err(e) = &result {
            warn!(table = %self.name, key, error = %e, "flush failed, entry stays pending");
        }
        result
    }
}

impl<V: Send + Sync> FlushTarget for Table<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pending_len(&self) -> usize {
        Table::pending_len(self)
    }

    fn try_flush(&self, locks: &dyn LockManager) -> ClawResult<FlushCounts> {
        catch_unwind(AssertUnwindSafe(|| Table::try_flush(self, locks)))
            .map_err(|_| ClawError::storage(&self.name, 0, "storage engine panicked during flush"))
    }

    fn flush_exclusive(&self) -> ClawResult<usize> {
        catch_unwind(AssertUnwindSafe(|| Table::flush_exclusive(self)))
            .map_err(|_| ClawError::storage(&self.name, 0, "storage engine panicked during flush"))?
    }
}

/// Seed mixed into every lock id of a table.
fn lock_seed(id: u32, lock_name: Option<&str>) -> u32 {
    let base = match lock_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name_hash(name),
        None => id,
    };
    base.wrapping_mul(LOCK_SEED_MIX)
}

/// 31-multiplier hash over UTF-16 code units; stable across runs and hosts.
fn name_hash(name: &str) -> u32 {
    name.encode_utf16().fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}
