//! Safe accessors — unsafe primitives plus rollback registration.
//!
//! Each mutating accessor captures what it is about to overwrite, applies the
//! unsafe primitive and hands an `UndoAction` to the caller's `TxContext`.
//! "Safe" refers to rollback, not locking: the caller still holds
//! `lock_id(key)` for the duration of the transaction.

use std::mem;
use std::sync::Arc;

use tracing::warn;

use crate::error::{ClawError, ClawResult};
use crate::record::{Field, RecordRef, SaveState};
use crate::table::Table;
use crate::txn::{TxContext, UndoAction};

/// Record handle bound to a table slot and reporting to a transaction.
pub struct SafeRecord<V> {
    table: Arc<Table<V>>,
    key: u64,
    record: RecordRef<V>,
}

impl<V: Send + Sync + 'static> Table<V> {
    pub fn get(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64) -> ClawResult<Option<SafeRecord<V>>> {
        let record = self.get_unsafe(key)?;
        Ok(record.map(|r| self.safe_record(tx, key, r)))
    }

    pub fn get_cache(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64) -> Option<SafeRecord<V>> {
        self.get_cache_unsafe(key).map(|r| self.safe_record(tx, key, r))
    }

    pub fn get_no_cache(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64) -> ClawResult<Option<SafeRecord<V>>> {
        let record = self.get_no_cache_unsafe(key)?;
        Ok(record.map(|r| self.safe_record(tx, key, r)))
    }

    /// Store `value` under `key`; rollback restores the slot as it was.
    pub fn put(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64, value: V) -> ClawResult<SafeRecord<V>> {
        let record = RecordRef::new(value);
        self.put_record(tx, key, record.clone())?;
        Ok(self.safe_record(tx, key, record))
    }

    /// Store an existing handle under `key`.
    ///
    /// Re-putting the instance already resolved for `key` only marks it
    /// modified. Any other attached record fails with `SharedRecord`.
    pub fn put_record(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64, record: RecordRef<V>) -> ClawResult<()> {
        if self.holds(key, &record) {
            return self.modify(key, &record);
        }
        if record.is_stored() {
            return Err(ClawError::SharedRecord { table: self.name.to_string(), key });
        }

        let prior_cached = self.cache_peek(key);
        let prior_pending = self.pending_entry(key);
        let prior_states: Vec<(RecordRef<V>, SaveState)> = prior_cached
            .iter()
            .chain(prior_pending.as_ref().and_then(|p| p.record()))
            .map(|r| (r.clone(), r.save_state()))
            .collect();

        self.put_record_unsafe(key, record.clone())?;

        let table = Arc::clone(self);
        tx.on_rollback(UndoAction::Slot {
            table: Arc::clone(&self.name),
            key,
            revert: Box::new(move || {
                table.restore_slot(key, &record, prior_cached, prior_pending);
                record.set_save_state(SaveState::Clean);
                for (r, state) in prior_states {
                    r.set_save_state(state);
                }
            }),
        });
        Ok(())
    }

    /// Store `value` under a fresh id; rollback deletes it again. The id is
    /// never reused.
    pub fn insert(self: &Arc<Self>, tx: &mut dyn TxContext, value: V) -> ClawResult<SafeRecord<V>> {
        let (key, record) = self.insert_unsafe(value)?;
        let table = Arc::clone(self);
        tx.on_rollback(UndoAction::Slot {
            table: Arc::clone(&self.name),
            key,
            revert: Box::new(move || table.remove_unsafe(key)),
        });
        Ok(self.safe_record(tx, key, record))
    }

    pub fn insert_default(self: &Arc<Self>, tx: &mut dyn TxContext) -> ClawResult<SafeRecord<V>>
    where
        V: Default,
    {
        self.insert(tx, V::default())
    }

    /// Delete `key`; rollback puts the removed record back. Returns false if
    /// nothing was stored under `key`.
    pub fn remove(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64) -> ClawResult<bool> {
        let Some(old) = self.get_no_cache_unsafe(key)? else { return Ok(false) };
        self.remove_unsafe(key);

        let table = Arc::clone(self);
        tx.on_rollback(UndoAction::Slot {
            table: Arc::clone(&self.name),
            key,
            revert: Box::new(move || {
                old.set_save_state(SaveState::Clean);
                if let Err(e) = table.put_record_unsafe(key, old) {
                    warn!(table = %table.name, key, error = %e, "undo of remove failed");
                }
            }),
        });
        Ok(true)
    }

    fn safe_record(self: &Arc<Self>, tx: &mut dyn TxContext, key: u64, record: RecordRef<V>) -> SafeRecord<V> {
        tx.register_record(&self.name, key, record.erase());
        SafeRecord { table: Arc::clone(self), key, record }
    }
}

impl<V: Send + Sync + 'static> SafeRecord<V> {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn record(&self) -> &RecordRef<V> {
        &self.record
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, V> {
        self.record.read()
    }

    pub fn get<T>(&self, field: &Field<V, T>) -> T {
        field.get(&self.record.read())
    }

    /// Write one field and mark the record modified; rollback restores the
    /// previous field value.
    pub fn set<T: Send + 'static>(&self, tx: &mut dyn TxContext, field: &Field<V, T>, value: T) -> ClawResult<()> {
        self.table.modify(self.key, &self.record)?;
        let old = {
            let mut guard = self.record.write();
            let old = field.get(&guard);
            field.set(&mut guard, value);
            old
        };
        let record = self.record.clone();
        let setter = field.setter();
        tx.on_rollback(UndoAction::Field {
            table: Arc::clone(&self.table.name),
            key: self.key,
            field: field.id,
            revert: Box::new(move || setter(&mut *record.write(), old)),
        });
        Ok(())
    }

    /// Replace the whole value and mark the record modified.
    pub fn assign(&self, tx: &mut dyn TxContext, value: V) -> ClawResult<()> {
        self.table.modify(self.key, &self.record)?;
        let old = mem::replace(&mut *self.record.write(), value);
        self.push_value_undo(tx, old);
        Ok(())
    }

    /// Mutate the value in place; rollback restores a snapshot taken first.
    pub fn update(&self, tx: &mut dyn TxContext, f: impl FnOnce(&mut V)) -> ClawResult<()>
    where
        V: Clone,
    {
        self.table.modify(self.key, &self.record)?;
        let old = self.record.snapshot();
        f(&mut *self.record.write());
        self.push_value_undo(tx, old);
        Ok(())
    }

    fn push_value_undo(&self, tx: &mut dyn TxContext, old: V) {
        let record = self.record.clone();
        tx.on_rollback(UndoAction::Value {
            table: Arc::clone(&self.table.name),
            key: self.key,
            revert: Box::new(move || *record.write() = old),
        });
    }
}
