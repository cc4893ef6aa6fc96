//! Store error types
//!
//! Backing-store failures are classified at the boundary so upper layers can
//! retry contention without string-matching: `Busy` covers `SQLITE_BUSY` and
//! `SQLITE_LOCKED`, everything else from the engine maps to `Db`.

use thiserror::Error;

/// Errors from the SQLite binding.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Engine error (statement failure, constraint violation, I/O).
    #[error("store db error: {0}")]
    Db(String),

    /// Contention: another handle holds a conflicting lock.
    #[error("store busy: {0}")]
    Busy(String),

    /// Invalid configuration or argument.
    #[error("store invalid: {0}")]
    Invalid(String),

    /// On-disk structure is not what the schema promises.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for contention errors worth retrying with backoff.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, _) = &e {
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Busy(e.to_string());
            }
        }
        StoreError::Db(e.to_string())
    }
}

impl From<StoreError> for vantage_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(msg) => vantage_core::Error::Config(msg),
            other => vantage_core::Error::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_classification() {
        assert!(StoreError::Busy("database is locked".into()).is_busy());
        assert!(!StoreError::Db("syntax error".into()).is_busy());
    }

    #[test]
    fn test_invalid_maps_to_config_error() {
        let core: vantage_core::Error = StoreError::Invalid("bad option".into()).into();
        assert!(matches!(core, vantage_core::Error::Config(_)));
    }

    #[test]
    fn test_db_maps_to_storage_error() {
        let core: vantage_core::Error = StoreError::Db("io error".into()).into();
        assert!(matches!(core, vantage_core::Error::Storage(_)));
    }
}
