//! SQLite handle wrapper
//!
//! One [`Store`] wraps one `rusqlite::Connection`. The engine gives every
//! connection its own `Store` (SQLite handles are not shared across threads
//! here), plus one more for the background checkpointer.
//!
//! Transaction control is explicit (`begin_read` / `begin_write` / `commit` /
//! `rollback`) because the engine holds transactions open across closure
//! boundaries that rusqlite's guard types cannot span.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use vantage_core::SettingValue;

use crate::error::StoreError;
use crate::options::StoreOptions;
use crate::schema;

/// Attempts made by `begin_write` before giving up on a busy database.
/// Each attempt already waits up to `busy_timeout_ms` inside SQLite.
const WRITE_BEGIN_ATTEMPTS: u32 = 3;

/// WAL checkpoint flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Checkpoint what can be done without waiting on readers.
    Passive,
    /// Block until the log is fully transferred and reset.
    Truncate,
}

impl CheckpointMode {
    fn pragma_value(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// Result row of a WAL checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointOutcome {
    /// The checkpoint could not run to completion because of contention.
    pub busy: bool,
    /// Frames in the log.
    pub log_frames: i64,
    /// Frames transferred into the database file.
    pub checkpointed_frames: i64,
}

/// One SQLite handle plus the statements prepared against it.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens (creating if absent) the database file and applies pragmas.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};",
            options.journal_mode.pragma_value()
        ))?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = {};",
            options.synchronous.pragma_value()
        ))?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);
        debug!(path = %path.display(), "opened store handle");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Creates the core tables. Idempotent.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(schema::CREATE_SCHEMA)?;
        Ok(())
    }

    /// Path this handle was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw handle, for extension-owned tables.
    ///
    /// Extensions run their own DML against tables they created through
    /// [`Store::execute_ddl`]; everything engine-owned goes through the typed
    /// methods below.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    /// Begins a read transaction and materializes its view of the database.
    pub fn begin_read(&self) -> Result<(), StoreError> {
        self.conn.prepare_cached("BEGIN DEFERRED")?.execute(params![])?;
        Ok(())
    }

    /// Begins a write transaction, retrying briefly when another process
    /// holds the write lock.
    pub fn begin_write(&self) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            let result = self
                .conn
                .prepare_cached("BEGIN IMMEDIATE")
                .and_then(|mut s| s.execute(params![]))
                .map(|_| ())
                .map_err(StoreError::from);
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_busy() && attempt < WRITE_BEGIN_ATTEMPTS => {
                    warn!(attempt, "write begin busy, backing off");
                    std::thread::sleep(Duration::from_millis(20 * u64::from(attempt)));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.prepare_cached("COMMIT")?.execute(params![])?;
        Ok(())
    }

    /// Rolls back the open transaction.
    pub fn rollback(&self) -> Result<(), StoreError> {
        self.conn.prepare_cached("ROLLBACK")?.execute(params![])?;
        Ok(())
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Reads the committed snapshot number. Zero on a fresh database.
    pub fn read_snapshot(&self) -> Result<u64, StoreError> {
        let value: Option<i64> = self
            .conn
            .prepare_cached(r#"SELECT "value" FROM "vantage" WHERE "key" = ?1"#)?
            .query_row(params![schema::BOOKKEEPING_SNAPSHOT], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    /// Persists the snapshot number inside the current write transaction.
    pub fn write_snapshot(&self, snapshot: u64) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"INSERT OR REPLACE INTO "vantage" ("key", "value") VALUES (?1, ?2)"#)?
            .execute(params![schema::BOOKKEEPING_SNAPSHOT, snapshot as i64])?;
        Ok(())
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Rowid for `key`, if the row exists.
    pub fn row_rowid(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let rowid = self
            .conn
            .prepare_cached(r#"SELECT "rowid" FROM "rows" WHERE "key" = ?1"#)?
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(rowid)
    }

    /// Data blob for `key`.
    pub fn row_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .conn
            .prepare_cached(r#"SELECT "data" FROM "rows" WHERE "key" = ?1"#)?
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(data)
    }

    /// Metadata for `key`. Outer `None` = no row, inner `None` = no metadata.
    pub fn row_metadata(&self, key: &str) -> Result<Option<Option<Vec<u8>>>, StoreError> {
        let metadata = self
            .conn
            .prepare_cached(r#"SELECT "metadata" FROM "rows" WHERE "key" = ?1"#)?
            .query_row(params![key], |row| row.get::<_, Option<Vec<u8>>>(0))
            .optional()?;
        Ok(metadata)
    }

    /// Full row for `key`.
    #[allow(clippy::type_complexity)]
    pub fn row(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
        let row = self
            .conn
            .prepare_cached(r#"SELECT "data", "metadata" FROM "rows" WHERE "key" = ?1"#)?
            .query_row(params![key], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
            })
            .optional()?;
        Ok(row)
    }

    /// Number of rows.
    pub fn row_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .prepare_cached(r#"SELECT COUNT(*) FROM "rows""#)?
            .query_row(params![], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Inserts a fresh row and returns its rowid. The caller has checked the
    /// key is absent.
    pub fn insert_row(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<i64, StoreError> {
        self.conn
            .prepare_cached(
                r#"INSERT INTO "rows" ("key", "data", "metadata") VALUES (?1, ?2, ?3)"#,
            )?
            .execute(params![key, data, metadata])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replaces data and metadata of an existing row.
    pub fn update_row(
        &self,
        rowid: i64,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"UPDATE "rows" SET "data" = ?2, "metadata" = ?3 WHERE "rowid" = ?1"#)?
            .execute(params![rowid, data, metadata])?;
        Ok(())
    }

    /// Replaces metadata only.
    pub fn update_row_metadata(&self, rowid: i64, metadata: Option<&[u8]>) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"UPDATE "rows" SET "metadata" = ?2 WHERE "rowid" = ?1"#)?
            .execute(params![rowid, metadata])?;
        Ok(())
    }

    /// Deletes one row.
    pub fn delete_row(&self, rowid: i64) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"DELETE FROM "rows" WHERE "rowid" = ?1"#)?
            .execute(params![rowid])?;
        Ok(())
    }

    /// Empties the row table.
    pub fn delete_all_rows(&self) -> Result<(), StoreError> {
        self.conn.prepare_cached(r#"DELETE FROM "rows""#)?.execute(params![])?;
        Ok(())
    }

    /// All keys, unordered.
    pub fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare_cached(r#"SELECT "key" FROM "rows""#)?;
        let keys = stmt
            .query_map(params![], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Streams `(rowid, key)` pairs. Return `false` from `f` to stop.
    pub fn enumerate_keys(
        &self,
        mut f: impl FnMut(i64, &str) -> bool,
    ) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(r#"SELECT "rowid", "key" FROM "rows""#)?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            if !f(rowid, &key) {
                break;
            }
        }
        Ok(())
    }

    /// Streams `(rowid, key, data)`. Return `false` from `f` to stop.
    pub fn enumerate_keys_and_data(
        &self,
        mut f: impl FnMut(i64, &str, &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(r#"SELECT "rowid", "key", "data" FROM "rows""#)?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let data: Vec<u8> = row.get(2)?;
            if !f(rowid, &key, &data) {
                break;
            }
        }
        Ok(())
    }

    /// Streams `(rowid, key, metadata)`. Return `false` from `f` to stop.
    pub fn enumerate_keys_and_metadata(
        &self,
        mut f: impl FnMut(i64, &str, Option<&[u8]>) -> bool,
    ) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(r#"SELECT "rowid", "key", "metadata" FROM "rows""#)?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let metadata: Option<Vec<u8>> = row.get(2)?;
            if !f(rowid, &key, metadata.as_deref()) {
                break;
            }
        }
        Ok(())
    }

    /// Streams full rows. Return `false` from `f` to stop.
    pub fn enumerate_rows(
        &self,
        mut f: impl FnMut(i64, &str, &[u8], Option<&[u8]>) -> bool,
    ) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(r#"SELECT "rowid", "key", "data", "metadata" FROM "rows""#)?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let data: Vec<u8> = row.get(2)?;
            let metadata: Option<Vec<u8>> = row.get(3)?;
            if !f(rowid, &key, &data, metadata.as_deref()) {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Extension settings
    // ========================================================================

    /// Reads one extension setting.
    pub fn ext_get(
        &self,
        extension: &str,
        key: &str,
    ) -> Result<Option<SettingValue>, StoreError> {
        let value: Option<rusqlite::types::Value> = self
            .conn
            .prepare_cached(
                r#"SELECT "value" FROM "vantage_ext" WHERE "extension" = ?1 AND "key" = ?2"#,
            )?
            .query_row(params![extension, key], |row| row.get(0))
            .optional()?;
        match value {
            None => Ok(None),
            Some(v) => Ok(Some(setting_from_sql(extension, key, v)?)),
        }
    }

    /// Writes one extension setting.
    pub fn ext_set(
        &self,
        extension: &str,
        key: &str,
        value: &SettingValue,
    ) -> Result<(), StoreError> {
        let sql_value = setting_to_sql(value);
        self.conn
            .prepare_cached(
                r#"INSERT OR REPLACE INTO "vantage_ext" ("extension", "key", "value")
                   VALUES (?1, ?2, ?3)"#,
            )?
            .execute(params![extension, key, sql_value])?;
        Ok(())
    }

    /// Deletes one extension setting.
    pub fn ext_delete_key(&self, extension: &str, key: &str) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"DELETE FROM "vantage_ext" WHERE "extension" = ?1 AND "key" = ?2"#)?
            .execute(params![extension, key])?;
        Ok(())
    }

    /// Deletes every setting scoped to `extension`.
    pub fn ext_delete_all(&self, extension: &str) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(r#"DELETE FROM "vantage_ext" WHERE "extension" = ?1"#)?
            .execute(params![extension])?;
        Ok(())
    }

    /// Names of extensions with persisted settings.
    pub fn ext_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(r#"SELECT DISTINCT "extension" FROM "vantage_ext""#)?;
        let names = stmt
            .query_map(params![], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ========================================================================
    // DDL and maintenance
    // ========================================================================

    /// Runs extension DDL (create/drop of extension tables).
    pub fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// True if a table with this exact name exists.
    pub fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .conn
            .prepare_cached(
                r#"SELECT "name" FROM "sqlite_master" WHERE "type" = 'table' AND "name" = ?1"#,
            )?
            .query_row(params![name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Runs a WAL checkpoint.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome, StoreError> {
        let sql = format!("PRAGMA wal_checkpoint({})", mode.pragma_value());
        let (busy, log_frames, checkpointed_frames): (i64, i64, i64) =
            self.conn.query_row(&sql, params![], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        Ok(CheckpointOutcome {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    }

    /// Drops every cached prepared statement.
    pub fn flush_statements(&self) {
        self.conn.flush_prepared_statement_cache();
    }
}

fn setting_to_sql(value: &SettingValue) -> rusqlite::types::Value {
    match value {
        SettingValue::Int(v) => rusqlite::types::Value::Integer(*v),
        SettingValue::Real(v) => rusqlite::types::Value::Real(*v),
        SettingValue::Text(v) => rusqlite::types::Value::Text(v.clone()),
        SettingValue::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

fn setting_from_sql(
    extension: &str,
    key: &str,
    value: rusqlite::types::Value,
) -> Result<SettingValue, StoreError> {
    match value {
        rusqlite::types::Value::Integer(v) => Ok(SettingValue::Int(v)),
        rusqlite::types::Value::Real(v) => Ok(SettingValue::Real(v)),
        rusqlite::types::Value::Text(v) => Ok(SettingValue::Text(v)),
        rusqlite::types::Value::Blob(v) => Ok(SettingValue::Blob(v)),
        rusqlite::types::Value::Null => Err(StoreError::Corrupt(format!(
            "null setting value for extension {extension:?} key {key:?}"
        ))),
    }
}
