//! Persistent page storage
//!
//! A view's ordering lives in two tables:
//!
//! - the map table, one row per key: `key -> page_id`
//! - the page table, one row per page: ordered key array (bincode blob),
//!   owning group, link to the next page, and a count.
//!
//! Chain order inside a group is carried by the `next_page_id` links and
//! rebuilt in memory at prepare time; a page's global position is never
//! stored.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;
use vantage_core::{Error, Result};
use vantage_store::StoreError;

/// Position and size of one page inside a group's ordered chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageMeta {
    pub(crate) page_id: String,
    pub(crate) count: usize,
}

/// One page's row as read back from the page table.
pub(crate) struct PageRecord {
    pub(crate) page_id: String,
    pub(crate) group: String,
    pub(crate) next_page_id: Option<String>,
    pub(crate) count: usize,
}

/// Fresh page identifier.
pub(crate) fn new_page_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Encodes a page's ordered key list for the `keys` blob column.
pub(crate) fn encode_keys(keys: &[String]) -> Result<Vec<u8>> {
    bincode::serialize(keys).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decodes a `keys` blob back into the ordered key list.
pub(crate) fn decode_keys(blob: &[u8]) -> Result<Vec<String>> {
    bincode::deserialize(blob).map_err(|e| Error::Serialization(e.to_string()))
}

/// Adapts a raw statement result into the engine's error type.
pub(crate) fn db<T>(result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|e| StoreError::from(e).into())
}

/// Prepared SQL for one view's tables. Table names are fixed at registration
/// (extension names are validated to `[A-Za-z0-9_]`), so the statements can
/// be formatted once and served from the statement cache after that.
pub(crate) struct ViewSql {
    map_table: String,
    page_table: String,
}

impl ViewSql {
    pub(crate) fn new(view_name: &str) -> Self {
        Self {
            map_table: format!("view_{view_name}_map"),
            page_table: format!("view_{view_name}_page"),
        }
    }

    /// DDL creating both tables. Run through the store's batch executor.
    pub(crate) fn create_tables_sql(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{map}" (
  "key" TEXT PRIMARY KEY NOT NULL,
  "page_id" TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "{page}" (
  "page_id" TEXT PRIMARY KEY NOT NULL,
  "group_name" TEXT NOT NULL,
  "next_page_id" TEXT,
  "count" INTEGER NOT NULL,
  "keys" BLOB NOT NULL
);"#,
            map = self.map_table,
            page = self.page_table,
        )
    }

    /// DDL dropping both tables.
    pub(crate) fn drop_tables_sql(&self) -> String {
        format!(
            r#"DROP TABLE IF EXISTS "{map}";
DROP TABLE IF EXISTS "{page}";"#,
            map = self.map_table,
            page = self.page_table,
        )
    }

    /// Name of the map table, for existence checks.
    pub(crate) fn map_table(&self) -> &str {
        &self.map_table
    }

    /// Name of the page table.
    pub(crate) fn page_table(&self) -> &str {
        &self.page_table
    }

    /// Reads every page's metadata (not the key blobs).
    pub(crate) fn load_structure(&self, conn: &Connection) -> Result<Vec<PageRecord>> {
        let sql = format!(
            r#"SELECT "page_id", "group_name", "next_page_id", "count" FROM "{}""#,
            self.page_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        let rows = db(stmt.query_map(params![], |row| {
            Ok(PageRecord {
                page_id: row.get(0)?,
                group: row.get(1)?,
                next_page_id: row.get(2)?,
                count: row.get::<_, i64>(3)? as usize,
            })
        }))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(db(row)?);
        }
        Ok(records)
    }

    /// Reads one page's ordered key list.
    pub(crate) fn load_page_keys(
        &self,
        conn: &Connection,
        page_id: &str,
    ) -> Result<Option<Vec<String>>> {
        let sql = format!(
            r#"SELECT "keys" FROM "{}" WHERE "page_id" = ?1"#,
            self.page_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        let blob: Option<Vec<u8>> = db(stmt
            .query_row(params![page_id], |row| row.get(0))
            .optional())?;
        match blob {
            Some(blob) => Ok(Some(decode_keys(&blob)?)),
            None => Ok(None),
        }
    }

    /// Looks up the page a key is filed under.
    pub(crate) fn lookup_map(&self, conn: &Connection, key: &str) -> Result<Option<String>> {
        let sql = format!(
            r#"SELECT "page_id" FROM "{}" WHERE "key" = ?1"#,
            self.map_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.query_row(params![key], |row| row.get(0)).optional())
    }

    /// Writes one page row wholesale.
    pub(crate) fn write_page(
        &self,
        conn: &Connection,
        page_id: &str,
        group: &str,
        next_page_id: Option<&str>,
        keys: &[String],
    ) -> Result<()> {
        let blob = encode_keys(keys)?;
        let sql = format!(
            r#"INSERT OR REPLACE INTO "{}" ("page_id", "group_name", "next_page_id", "count", "keys")
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            self.page_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.execute(params![page_id, group, next_page_id, keys.len() as i64, blob]))?;
        Ok(())
    }

    /// Rewrites a page's chain link and count, leaving the key blob alone.
    pub(crate) fn update_page_link(
        &self,
        conn: &Connection,
        page_id: &str,
        next_page_id: Option<&str>,
        count: usize,
    ) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET "next_page_id" = ?2, "count" = ?3 WHERE "page_id" = ?1"#,
            self.page_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.execute(params![page_id, next_page_id, count as i64]))?;
        Ok(())
    }

    /// Deletes one page row.
    pub(crate) fn delete_page(&self, conn: &Connection, page_id: &str) -> Result<()> {
        let sql = format!(r#"DELETE FROM "{}" WHERE "page_id" = ?1"#, self.page_table);
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.execute(params![page_id]))?;
        Ok(())
    }

    /// Files `key` under `page_id`.
    pub(crate) fn set_map(&self, conn: &Connection, key: &str, page_id: &str) -> Result<()> {
        let sql = format!(
            r#"INSERT OR REPLACE INTO "{}" ("key", "page_id") VALUES (?1, ?2)"#,
            self.map_table
        );
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.execute(params![key, page_id]))?;
        Ok(())
    }

    /// Removes `key` from the map table.
    pub(crate) fn delete_map(&self, conn: &Connection, key: &str) -> Result<()> {
        let sql = format!(r#"DELETE FROM "{}" WHERE "key" = ?1"#, self.map_table);
        let mut stmt = db(conn.prepare_cached(&sql))?;
        db(stmt.execute(params![key]))?;
        Ok(())
    }

    /// Empties both tables without dropping them.
    pub(crate) fn clear(&self, conn: &Connection) -> Result<()> {
        for table in [&self.map_table, &self.page_table] {
            let sql = format!(r#"DELETE FROM "{table}""#);
            let mut stmt = db(conn.prepare_cached(&sql))?;
            db(stmt.execute(params![]))?;
        }
        Ok(())
    }
}
