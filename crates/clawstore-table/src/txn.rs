//! Transaction context seen by the safe accessors.
//!
//! Safe accessors do not own a transaction; they record into whatever
//! `TxContext` the caller passes. `SoftTransaction` is the default context:
//! it collects undo actions and either discards them (commit) or applies
//! them newest-first (rollback).

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::record::ErasedRecord;

/// One undo step, tagged by what it restores.
pub enum UndoAction {
    /// Restores a table slot (read cache and write-back buffer) for a key
    Slot {
        table: Arc<str>,
        key: u64,
        revert: Box<dyn FnOnce() + Send>,
    },
    /// Restores one field of a record
    Field {
        table: Arc<str>,
        key: u64,
        field: u16,
        revert: Box<dyn FnOnce() + Send>,
    },
    /// Restores a whole record value
    Value {
        table: Arc<str>,
        key: u64,
        revert: Box<dyn FnOnce() + Send>,
    },
}

impl UndoAction {
    pub fn table(&self) -> &str {
        match self {
            UndoAction::Slot { table, .. }
            | UndoAction::Field { table, .. }
            | UndoAction::Value { table, .. } => table,
        }
    }

    pub fn key(&self) -> u64 {
        match self {
            UndoAction::Slot { key, .. }
            | UndoAction::Field { key, .. }
            | UndoAction::Value { key, .. } => *key,
        }
    }

    /// Apply the undo step.
    pub fn revert(self) {
        match self {
            UndoAction::Slot { table, key, revert } => {
                trace!(%table, key, "undo slot");
                revert()
            }
            UndoAction::Field { table, key, field, revert } => {
                trace!(%table, key, field, "undo field");
                revert()
            }
            UndoAction::Value { table, key, revert } => {
                trace!(%table, key, "undo value");
                revert()
            }
        }
    }
}

impl fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            UndoAction::Slot { .. } => "Slot",
            UndoAction::Field { .. } => "Field",
            UndoAction::Value { .. } => "Value",
        };
        f.debug_struct("UndoAction")
            .field("kind", &kind)
            .field("table", &self.table())
            .field("key", &self.key())
            .finish()
    }
}

/// Unit of work that safe accessors report to.
pub trait TxContext {
    /// Register an action to run if the unit of work aborts.
    fn on_rollback(&mut self, action: UndoAction);

    /// Note that the transaction handed out a safe handle to `record`, the
    /// instance stored under `key` in `table`.
    fn register_record(&mut self, table: &Arc<str>, key: u64, record: ErasedRecord);
}

/// A record handed out to a transaction through a safe accessor.
#[derive(Debug, Clone)]
pub struct Registered {
    pub table: Arc<str>,
    pub key: u64,
    pub record: ErasedRecord,
}

/// Collects undo actions; rolls back on drop unless committed.
#[derive(Default)]
pub struct SoftTransaction {
    undo: Vec<UndoAction>,
    records: Vec<Registered>,
    finished: bool,
}

impl SoftTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending undo actions.
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Records handed out through safe accessors, in access order.
    pub fn records(&self) -> &[Registered] {
        &self.records
    }

    /// Keep all changes. Returns the number of discarded undo actions.
    pub fn commit(mut self) -> usize {
        self.finished = true;
        let n = self.undo.len();
        self.undo.clear();
        n
    }

    /// Undo all changes, newest first. Returns the number of applied actions.
    pub fn rollback(mut self) -> usize {
        self.finished = true;
        self.apply_undo()
    }

    fn apply_undo(&mut self) -> usize {
        let n = self.undo.len();
        while let Some(action) = self.undo.pop() {
            action.revert();
        }
        n
    }
}

impl TxContext for SoftTransaction {
    fn on_rollback(&mut self, action: UndoAction) {
        self.undo.push(action);
    }

    fn register_record(&mut self, table: &Arc<str>, key: u64, record: ErasedRecord) {
        self.records.push(Registered { table: Arc::clone(table), key, record });
    }
}

impl Drop for SoftTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            trace!(actions = self.undo.len(), "soft transaction dropped, rolling back");
            self.apply_undo();
        }
    }
}
