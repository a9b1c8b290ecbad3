//! Storage engine interface.
//!
//! Tables reach their durable copy only through this trait. The engine owns
//! the value encoding; tables hand it `&V` on write and receive an owned `V`
//! on read. `MemoryStorage` is a BTreeMap-backed engine for memory-resident
//! deployments and tests.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::ClawResult;

/// Durable key-value engine for one table.
pub trait Storage<V>: Send + Sync {
    /// Load the value stored for `key`.
    fn get(&self, key: u64) -> ClawResult<Option<V>>;

    /// Store `value` for `key`, replacing any previous value.
    fn put(&self, key: u64, value: &V) -> ClawResult<()>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn remove(&self, key: u64) -> ClawResult<()>;

    /// Visit stored keys within `[from, to]` bounds in key order (descending
    /// when `reverse`). Returns false if the visitor stopped the walk early.
    fn walk(
        &self,
        from: Bound<u64>,
        to: Bound<u64>,
        reverse: bool,
        visitor: &mut dyn FnMut(u64) -> bool,
    ) -> ClawResult<bool>;

    /// Last auto-id counter value written by `set_id_counter`.
    fn id_counter(&self) -> ClawResult<u64>;

    fn set_id_counter(&self, counter: u64) -> ClawResult<()>;
}

/// Storage engine keeping every value in an ordered map.
pub struct MemoryStorage<V> {
    data: RwLock<BTreeMap<u64, V>>,
    id_counter: AtomicU64,
}

impl<V> MemoryStorage<V> {
    pub fn new() -> Self {
        Self { data: RwLock::new(BTreeMap::new()), id_counter: AtomicU64::new(0) }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.data.read().contains_key(&key)
    }
}

impl<V> Default for MemoryStorage<V> {
    fn default() -> Self { Self::new() }
}

impl<V: Clone + Send + Sync> Storage<V> for MemoryStorage<V> {
    fn get(&self, key: u64) -> ClawResult<Option<V>> {
        Ok(self.data.read().get(&key).cloned())
    }

    fn put(&self, key: u64, value: &V) -> ClawResult<()> {
        self.data.write().insert(key, value.clone());
        Ok(())
    }

    fn remove(&self, key: u64) -> ClawResult<()> {
        self.data.write().remove(&key);
        Ok(())
    }

    fn walk(
        &self,
        from: Bound<u64>,
        to: Bound<u64>,
        reverse: bool,
        visitor: &mut dyn FnMut(u64) -> bool,
    ) -> ClawResult<bool> {
        if range_is_empty(from, to) {
            return Ok(true);
        }
        // Snapshot keys so the visitor may touch the table (and this engine)
        let keys: Vec<u64> = self.data.read().range((from, to)).map(|(k, _)| *k).collect();
        let completed = if reverse {
            keys.into_iter().rev().all(|k| visitor(k))
        } else {
            keys.into_iter().all(|k| visitor(k))
        };
        Ok(completed)
    }

    fn id_counter(&self) -> ClawResult<u64> {
        Ok(self.id_counter.load(Ordering::Acquire))
    }

    fn set_id_counter(&self, counter: u64) -> ClawResult<()> {
        self.id_counter.store(counter, Ordering::Release);
        Ok(())
    }
}

/// BTreeMap::range panics on inverted or doubly-excluded equal bounds.
fn range_is_empty(from: Bound<u64>, to: Bound<u64>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> MemoryStorage<String> {
        let sto = MemoryStorage::new();
        for k in [5u64, 1, 9, 3, 7] {
            sto.put(k, &format!("v{}", k)).unwrap();
        }
        sto
    }

    fn collect(sto: &MemoryStorage<String>, from: Bound<u64>, to: Bound<u64>, reverse: bool) -> Vec<u64> {
        let mut seen = Vec::new();
        assert!(sto.walk(from, to, reverse, &mut |k| { seen.push(k); true }).unwrap());
        seen
    }

    #[test]
    fn test_put_get_remove() {
        let sto = filled();
        assert_eq!(sto.get(5).unwrap(), Some("v5".to_string()));
        sto.remove(5).unwrap();
        assert_eq!(sto.get(5).unwrap(), None);
        sto.remove(5).unwrap();
        assert_eq!(sto.len(), 4);
    }

    #[test]
    fn test_walk_order_and_bounds() {
        let sto = filled();
        assert_eq!(collect(&sto, Bound::Unbounded, Bound::Unbounded, false), vec![1, 3, 5, 7, 9]);
        assert_eq!(collect(&sto, Bound::Included(3), Bound::Included(7), true), vec![7, 5, 3]);
        assert_eq!(collect(&sto, Bound::Excluded(3), Bound::Excluded(7), false), vec![5]);
        assert!(collect(&sto, Bound::Included(8), Bound::Included(2), false).is_empty());
        assert!(collect(&sto, Bound::Excluded(4), Bound::Excluded(4), false).is_empty());
    }

    #[test]
    fn test_walk_early_stop() {
        let sto = filled();
        let mut seen = Vec::new();
        let completed = sto.walk(Bound::Unbounded, Bound::Unbounded, false, &mut |k| {
            seen.push(k);
            k < 5
        }).unwrap();
        assert!(!completed);
        assert_eq!(seen, vec![1, 3, 5]);
    }

    #[test]
    fn test_id_counter() {
        let sto: MemoryStorage<String> = MemoryStorage::new();
        assert_eq!(sto.id_counter().unwrap(), 0);
        sto.set_id_counter(42).unwrap();
        assert_eq!(sto.id_counter().unwrap(), 42);
    }
}
