//! Error types for ClawStore table operations
//!
//! All table errors are represented by the ClawError enum. Programming errors
//! (`UnmatchedModify`, `SharedRecord`) are raised before any cache is touched,
//! so a caller that receives one sees the table exactly as it was.

use thiserror::Error;

/// ClawStore table error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum ClawError {
    /// `modify` was called with a record that is not the instance held by the
    /// write-back buffer for that key
    #[error("modify unmatched record: table={table}, key={key}")]
    UnmatchedModify {
        /// Table name
        table: String,
        /// Record key
        key: u64,
    },

    /// `put`/`insert` was called with a record already attached to a table
    #[error("put shared record: table={table}, key={key}")]
    SharedRecord {
        /// Table name
        table: String,
        /// Record key (0 for inserts that never got an id)
        key: u64,
    },

    /// The storage engine failed to read or persist one entry
    #[error("storage failure in table {table} at key {key}: {message}")]
    Storage {
        /// Table name
        table: String,
        /// Record key
        key: u64,
        /// Engine-provided description
        message: String,
    },

    /// Auto-id parameters can no longer change for this table
    #[error("auto-id layout of table {table} is already fixed")]
    AutoIdLocked {
        /// Table name
        table: String,
    },

    /// The auto-id counter no longer fits the key space after shifting
    #[error("auto-id space exhausted in table {table}")]
    IdSpaceExhausted {
        /// Table name
        table: String,
    },

    /// Configuration parameter out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O operation failed inside a file-backed storage engine
    #[error("I/O error: {message} ({kind})")]
    Io {
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl ClawError {
    /// Build a storage error for `key` in `table`.
    pub fn storage(table: &str, key: u64, message: impl Into<String>) -> Self {
        ClawError::Storage {
            table: table.to_string(),
            key,
            message: message.into(),
        }
    }

    /// True for errors caused by the caller breaking the single-owner rules.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, ClawError::UnmatchedModify { .. } | ClawError::SharedRecord { .. })
    }
}

/// Convert std::io::Error to ClawError::Io
impl From<std::io::Error> for ClawError {
    fn from(err: std::io::Error) -> Self {
        ClawError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for ClawStore table operations
pub type ClawResult<T> = Result<T, ClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClawError::UnmatchedModify { table: "player".into(), key: 42 };
        let display = format!("{}", err);
        assert!(display.contains("modify unmatched record"));
        assert!(display.contains("player"));
        assert!(display.contains("42"));

        let err = ClawError::storage("item", 7, "disk full");
        assert_eq!(format!("{}", err), "storage failure in table item at key 7: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let claw_err: ClawError = io_err.into();

        match &claw_err {
            ClawError::Io { kind, .. } => assert_eq!(*kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
        assert!(format!("{}", claw_err).starts_with("I/O error: "));
    }

    #[test]
    fn test_programming_error_classification() {
        assert!(ClawError::SharedRecord { table: "t".into(), key: 1 }.is_programming_error());
        assert!(!ClawError::storage("t", 1, "x").is_programming_error());
        assert!(!ClawError::InvalidConfig("x".into()).is_programming_error());
    }
}
