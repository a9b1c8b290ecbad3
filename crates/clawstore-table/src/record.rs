//! Shared record handles and their save-state.
//!
//! A record lives behind an `Arc` so the read cache and the write-back buffer
//! can both hold the same instance. Identity (`Arc::ptr_eq`), not equality, is
//! what the table uses to decide whether a caller is presenting the record it
//! fetched earlier.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle stage of a record relative to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SaveState {
    /// Not attached to any table: fresh, detached, or reset by an undo.
    Clean = 0,
    /// Attached and written to storage this round; the cached copy is current.
    Persisted = 1,
    /// Attached and mutated; pending flush.
    Dirty = 2,
}

impl SaveState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SaveState::Persisted,
            2 => SaveState::Dirty,
            _ => SaveState::Clean,
        }
    }
}

/// A value plus its save-state.
pub struct Record<V> {
    value: RwLock<V>,
    state: AtomicU8,
}

impl<V> Record<V> {
    fn new(value: V, state: SaveState) -> Self {
        Self { value: RwLock::new(value), state: AtomicU8::new(state as u8) }
    }
}

/// Reference-counted handle to a record.
///
/// Cloning the handle shares the record; it does not copy the value.
pub struct RecordRef<V>(Arc<Record<V>>);

impl<V> RecordRef<V> {
    /// Wrap a fresh, unattached value.
    pub fn new(value: V) -> Self {
        Self(Arc::new(Record::new(value, SaveState::Clean)))
    }

    pub(crate) fn loaded(value: V) -> Self {
        Self(Arc::new(Record::new(value, SaveState::Persisted)))
    }

    /// Read access to the value.
    pub fn read(&self) -> RwLockReadGuard<'_, V> {
        self.0.value.read()
    }

    /// Write access to the value. Call `Table::modify` afterwards so the
    /// change reaches the write-back buffer.
    pub fn write(&self) -> RwLockWriteGuard<'_, V> {
        self.0.value.write()
    }

    /// Current save-state.
    pub fn save_state(&self) -> SaveState {
        SaveState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_save_state(&self, state: SaveState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// True once the record is attached to a table.
    pub fn is_stored(&self) -> bool {
        self.save_state() != SaveState::Clean
    }

    /// True while the record has changes not yet flushed.
    pub fn is_modified(&self) -> bool {
        self.save_state() == SaveState::Dirty
    }

    /// Identity comparison.
    pub fn same(&self, other: &RecordRef<V>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<V: Send + Sync + 'static> RecordRef<V> {
    /// Type-erased handle to the same instance.
    pub fn erase(&self) -> ErasedRecord {
        ErasedRecord(self.0.clone())
    }
}

impl<V: Clone> RecordRef<V> {
    /// Copy of the current value.
    pub fn snapshot(&self) -> V {
        self.read().clone()
    }
}

impl<V> Clone for RecordRef<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V: fmt::Debug> fmt::Debug for RecordRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRef")
            .field("state", &self.save_state())
            .field("value", &*self.read())
            .finish()
    }
}

/// Record handle with its value type erased, as seen by a transaction context.
#[derive(Clone)]
pub struct ErasedRecord(Arc<dyn Any + Send + Sync>);

impl ErasedRecord {
    /// Recover the typed handle; `None` if `V` is not the record's type.
    pub fn downcast<V: Send + Sync + 'static>(&self) -> Option<RecordRef<V>> {
        Arc::clone(&self.0).downcast::<Record<V>>().ok().map(RecordRef)
    }

    /// True if this is the very instance `record` points at.
    pub fn is<V: Send + Sync + 'static>(&self, record: &RecordRef<V>) -> bool {
        self.downcast::<V>().is_some_and(|r| r.same(record))
    }
}

impl fmt::Debug for ErasedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErasedRecord").field(&Arc::as_ptr(&self.0)).finish()
    }
}

/// Typed accessor pair for one field of a value.
///
/// Field writes made through a `SafeRecord` capture the prior field value and
/// register an undo that applies it back through `set`.
pub struct Field<V, T> {
    /// Stable field number
    pub id: u16,
    /// Field name, used in logs
    pub name: &'static str,
    get: fn(&V) -> T,
    set: fn(&mut V, T),
}

impl<V, T> Field<V, T> {
    pub const fn new(id: u16, name: &'static str, get: fn(&V) -> T, set: fn(&mut V, T)) -> Self {
        Self { id, name, get, set }
    }

    pub fn get(&self, value: &V) -> T {
        (self.get)(value)
    }

    pub fn set(&self, value: &mut V, field: T) {
        (self.set)(value, field)
    }

    pub(crate) fn setter(&self) -> fn(&mut V, T) {
        self.set
    }
}
