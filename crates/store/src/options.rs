//! Store configuration
//!
//! # Invariants
//! - Values map 1:1 to SQLite pragma settings.
//! - `busy_timeout_ms` is interpreted as milliseconds.

use serde::{Deserialize, Serialize};

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead log. Readers do not block the writer.
    Wal,
    /// Rollback journal with full deletes. Mostly for diagnostics.
    Delete,
}

impl JournalMode {
    /// Returns the SQLite pragma value.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
        }
    }
}

/// SQLite synchronous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Fsync at the critical moments. Durable across power loss.
    Full,
    /// Fsync less often. Durable across app crash, not power loss.
    Normal,
    /// No fsync. Test databases only.
    Off,
}

impl SyncMode {
    /// Returns the SQLite pragma value.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            SyncMode::Full => "FULL",
            SyncMode::Normal => "NORMAL",
            SyncMode::Off => "OFF",
        }
    }
}

/// Options applied to every SQLite handle the engine opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// How long a statement waits on a conflicting lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Journal mode pragma.
    #[serde(default = "default_journal_mode")]
    pub journal_mode: JournalMode,
    /// Synchronous mode pragma.
    #[serde(default = "default_sync_mode")]
    pub synchronous: SyncMode,
    /// Capacity of the per-handle prepared statement cache.
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_journal_mode() -> JournalMode {
    JournalMode::Wal
}

const fn default_sync_mode() -> SyncMode {
    SyncMode::Full
}

const fn default_statement_cache_capacity() -> usize {
    64
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: default_journal_mode(),
            synchronous: default_sync_mode(),
            statement_cache_capacity: default_statement_cache_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = StoreOptions::default();
        assert_eq!(opts.busy_timeout_ms, 5_000);
        assert_eq!(opts.journal_mode, JournalMode::Wal);
        assert_eq!(opts.synchronous, SyncMode::Full);
        assert!(opts.statement_cache_capacity > 0);
    }

    #[test]
    fn test_pragma_values() {
        assert_eq!(JournalMode::Wal.pragma_value(), "WAL");
        assert_eq!(SyncMode::Normal.pragma_value(), "NORMAL");
    }
}
