//! End-to-end behaviour of tables, flushes and transactions over shared storage.

use std::collections::HashSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use clawstore_table::{
    ClawError, ClawResult, Config, LockManager, MemoryStorage, SaveState, ShardLocks,
    SoftTransaction, Storage, Table, TableOptions, TableRegistry,
};
use proptest::prelude::*;

fn registry() -> TableRegistry {
    TableRegistry::new(Config::embedded()).unwrap()
}

fn open(reg: &TableRegistry, id: u32, name: &str, sto: &Arc<MemoryStorage<String>>) -> Arc<Table<String>> {
    Table::open(reg, TableOptions::new(id, name), Some(sto.clone() as Arc<dyn Storage<String>>)).unwrap()
}

/// Storage wrapper whose first `put` of a chosen key runs a callback.
struct HookStorage {
    inner: MemoryStorage<String>,
    hook_key: u64,
    fired: AtomicBool,
    table: OnceLock<Weak<Table<String>>>,
}

impl Storage<String> for HookStorage {
    fn get(&self, key: u64) -> ClawResult<Option<String>> {
        self.inner.get(key)
    }

    fn put(&self, key: u64, value: &String) -> ClawResult<()> {
        self.inner.put(key, value)?;
        if key == self.hook_key && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(table) = self.table.get().and_then(Weak::upgrade) {
                // Writer holding the key's lock elsewhere swaps in a new instance
                table.put_unsafe(key, "B".to_string())?;
            }
        }
        Ok(())
    }

    fn remove(&self, key: u64) -> ClawResult<()> {
        self.inner.remove(key)
    }

    fn walk(&self, from: Bound<u64>, to: Bound<u64>, reverse: bool, visitor: &mut dyn FnMut(u64) -> bool) -> ClawResult<bool> {
        self.inner.walk(from, to, reverse, visitor)
    }

    fn id_counter(&self) -> ClawResult<u64> {
        self.inner.id_counter()
    }

    fn set_id_counter(&self, counter: u64) -> ClawResult<()> {
        self.inner.set_id_counter(counter)
    }
}

/// Storage whose writes fail while `failing` is set.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage<String>,
    failing: AtomicBool,
}

impl Storage<String> for FlakyStorage {
    fn get(&self, key: u64) -> ClawResult<Option<String>> {
        self.inner.get(key)
    }

    fn put(&self, key: u64, value: &String) -> ClawResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClawError::storage("flaky", key, "write refused"));
        }
        self.inner.put(key, value)
    }

    fn remove(&self, key: u64) -> ClawResult<()> {
        self.inner.remove(key)
    }

    fn walk(&self, from: Bound<u64>, to: Bound<u64>, reverse: bool, visitor: &mut dyn FnMut(u64) -> bool) -> ClawResult<bool> {
        self.inner.walk(from, to, reverse, visitor)
    }

    fn id_counter(&self) -> ClawResult<u64> {
        self.inner.id_counter()
    }

    fn set_id_counter(&self, counter: u64) -> ClawResult<()> {
        self.inner.set_id_counter(counter)
    }
}

#[test]
fn test_incremental_flush_survives_reopen() {
    let reg = registry();
    let locks = ShardLocks::from_config(reg.config());
    let sto = Arc::new(MemoryStorage::new());
    let table = open(&reg, 1, "items", &sto);

    {
        let _guard = locks.lock(table.lock_id(10));
        let a = table.put_unsafe(10, "A".to_string()).unwrap();
        table.modify(10, &a).unwrap();
    }
    let counts = reg.try_flush_all(&locks);
    assert_eq!(counts.remaining, 0);
    assert_eq!(sto.get(10).unwrap().as_deref(), Some("A"));
    assert_eq!(table.pending_len(), 0);

    let reg2 = registry();
    let reopened = open(&reg2, 1, "items", &sto);
    let r = reopened.get_unsafe(10).unwrap().unwrap();
    assert_eq!(*r.read(), "A");
    assert_eq!(r.save_state(), SaveState::Persisted);
}

#[test]
fn test_flush_keeps_entry_replaced_during_persist() {
    let reg = registry();
    let locks = ShardLocks::new(64);
    let sto = Arc::new(HookStorage {
        inner: MemoryStorage::new(),
        hook_key: 10,
        fired: AtomicBool::new(false),
        table: OnceLock::new(),
    });
    let table = Table::open(&reg, TableOptions::new(1, "hooked"), Some(sto.clone() as Arc<dyn Storage<String>>)).unwrap();
    assert!(sto.table.set(Arc::downgrade(&table)).is_ok());

    let a = table.put_unsafe(10, "A".to_string()).unwrap();
    let counts = table.try_flush(&locks);
    assert_eq!(counts.flushed, 0);
    assert_eq!(counts.remaining, 1);
    assert_eq!(sto.inner.get(10).unwrap().as_deref(), Some("A"));
    assert_eq!(a.save_state(), SaveState::Persisted);

    let b = table.get_cache_unsafe(10).unwrap();
    assert_eq!(*b.read(), "B");
    assert!(b.is_modified());

    table.try_flush(&locks);
    assert_eq!(sto.inner.get(10).unwrap().as_deref(), Some("B"));
    assert_eq!(table.pending_len(), 0);
}

#[test]
fn test_exclusive_flush_saves_counter() {
    let reg = registry();
    let sto = Arc::new(MemoryStorage::new());
    let table = open(&reg, 1, "ids", &sto);
    for _ in 0..5 {
        table.insert_unsafe("x".to_string()).unwrap();
    }
    table.remove_unsafe(2);

    assert_eq!(reg.flush_all_exclusive(), 5);
    assert_eq!(table.pending_len(), 0);
    assert_eq!(sto.id_counter().unwrap(), table.id_counter());
    assert_eq!(sto.len(), 4);

    let reg2 = registry();
    let reopened = open(&reg2, 1, "ids", &sto);
    assert_eq!(reopened.next_id().unwrap(), 6);
}

#[test]
fn test_concurrent_next_id_distinct() {
    let reg = registry();
    let sto = Arc::new(MemoryStorage::new());
    sto.put(3, &"taken".to_string()).unwrap();
    let table = open(&reg, 1, "ids", &sto);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || (0..200).map(|_| table.next_id().unwrap()).collect::<Vec<_>>())
        })
        .collect();
    let mut seen = HashSet::new();
    for h in handles {
        for id in h.join().unwrap() {
            assert!(seen.insert(id), "duplicate id {}", id);
        }
    }
    assert_eq!(seen.len(), 1600);
    assert!(!seen.contains(&3));
}

#[test]
fn test_eviction_never_drops_pending_write() {
    let reg = registry();
    let sto = Arc::new(MemoryStorage::new());
    let table = Table::open(
        &reg,
        TableOptions::new(1, "small").cache_capacity(4),
        Some(sto.clone() as Arc<dyn Storage<String>>),
    ).unwrap();

    for k in 0..20u64 {
        table.put_unsafe(k, format!("v{}", k)).unwrap();
    }
    assert!(table.cache_len() <= 6);
    assert!(table.cache_stats().evictions > 0);
    for k in 0..20u64 {
        assert_eq!(*table.get_unsafe(k).unwrap().unwrap().read(), format!("v{}", k));
    }
    reg.flush_all_exclusive();
    assert_eq!(sto.len(), 20);
}

#[test]
fn test_storage_failure_isolated_per_table() {
    let reg = registry();
    let locks = ShardLocks::new(64);
    let flaky = Arc::new(FlakyStorage::default());
    flaky.failing.store(true, Ordering::SeqCst);
    let healthy = Arc::new(MemoryStorage::new());

    let bad = Table::open(&reg, TableOptions::new(1, "bad"), Some(flaky.clone() as Arc<dyn Storage<String>>)).unwrap();
    let good = open(&reg, 2, "good", &healthy);
    bad.put_unsafe(1, "x".to_string()).unwrap();
    good.put_unsafe(1, "y".to_string()).unwrap();

    let counts = reg.try_flush_all(&locks);
    assert_eq!(counts.seen, 2);
    assert_eq!(counts.flushed, 1);
    assert_eq!(bad.pending_len(), 1);
    assert!(healthy.contains_key(1));

    // The entry survives and goes out once the engine recovers
    flaky.failing.store(false, Ordering::SeqCst);
    assert_eq!(reg.flush_all_exclusive(), 1);
    assert!(flaky.inner.contains_key(1));
}

#[test]
fn test_transaction_abort_restores_removed_value() {
    let reg = registry();
    let locks = ShardLocks::new(64);
    let sto = Arc::new(MemoryStorage::new());
    sto.put(10, &"before".to_string()).unwrap();
    let table = open(&reg, 1, "docs", &sto);

    {
        let _guard = locks.lock(table.lock_id(10));
        let mut tx = SoftTransaction::new();
        assert!(table.remove(&mut tx, 10).unwrap());
        assert!(table.get(&mut tx, 10).unwrap().is_none());
        tx.rollback();
    }
    assert_eq!(*table.get_unsafe(10).unwrap().unwrap().read(), "before");
}

#[test]
fn test_transaction_over_two_tables() {
    let reg = registry();
    let locks = ShardLocks::new(64);
    let sto_a = Arc::new(MemoryStorage::new());
    let sto_b = Arc::new(MemoryStorage::new());
    let a = open(&reg, 1, "a", &sto_a);
    let b = open(&reg, 2, "b", &sto_b);

    let _guards = locks.lock_many(&[a.lock_id(5), b.lock_id(5)]);
    let mut tx = SoftTransaction::new();
    a.put(&mut tx, 5, "left".to_string()).unwrap();
    let inserted = b.insert(&mut tx, "right".to_string()).unwrap();
    let key = inserted.key();
    assert_eq!(tx.records().len(), 2);
    assert_eq!(tx.rollback(), 2);

    assert!(a.get_unsafe(5).unwrap().is_none());
    assert!(b.get_unsafe(key).unwrap().is_none());
    assert_eq!(a.pending_len(), 0);
    // The aborted insert leaves a tombstone and its id stays burnt
    assert_eq!(b.pending_len(), 1);
    assert!(b.next_id().unwrap() > key);
}

#[test]
fn test_lock_name_groups_tables() {
    let reg = registry();
    let sto_a = Arc::new(MemoryStorage::new());
    let sto_b = Arc::new(MemoryStorage::new());
    let a = Table::open(&reg, TableOptions::new(1, "a").lock_name("bag"), Some(sto_a as Arc<dyn Storage<String>>)).unwrap();
    let b = Table::open(&reg, TableOptions::new(2, "b").lock_name("bag"), Some(sto_b as Arc<dyn Storage<String>>)).unwrap();
    assert_eq!(a.lock_id(77), b.lock_id(77));
    assert_eq!(reg.table_names(), vec!["a", "b"]);
}

fn memory_table(low_bits: u32, offset: u64) -> Arc<Table<u8>> {
    let reg = registry();
    let table = Table::open(&reg, TableOptions::new(1, "prop"), None).unwrap();
    table.set_auto_id(low_bits, offset).unwrap();
    table
}

proptest! {
    #[test]
    fn prop_lock_id_folds_key_halves(id in any::<u32>(), key in any::<u64>()) {
        let reg = registry();
        let table: Arc<Table<u8>> = Table::open(&reg, TableOptions::new(id, "t"), None).unwrap();
        let folded = (key as u32) ^ ((key >> 32) as u32);
        prop_assert_eq!(table.lock_id(key) ^ table.lock_id(0), folded);
        let swapped = key.rotate_left(32);
        prop_assert_eq!(table.lock_id(key), table.lock_id(swapped));
    }

    #[test]
    fn prop_auto_ids_keep_layout(low_bits in 0u32..=12, seed in any::<u64>(), count in 1usize..20) {
        let offset = if low_bits == 0 { 0 } else { seed % (1u64 << low_bits) };
        let table = memory_table(low_bits, offset);
        let mut last = 0u64;
        for _ in 0..count {
            let (key, _) = table.insert_unsafe(0).unwrap();
            prop_assert_eq!(key & ((1u64 << low_bits) - 1), offset);
            prop_assert!(key > last);
            last = key;
        }
    }
}
