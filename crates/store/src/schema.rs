//! Core schema
//!
//! Three tables make up the engine's own footprint. Extensions create their
//! tables through DDL helpers on [`crate::Store`] and record them in the
//! settings table so a later run can drop them without the extension type.
//!
//! # Invariants
//! - `rows.key` is unique; the implicit rowid is handed to extension hooks.
//! - The committed snapshot number is persisted under `BOOKKEEPING_SNAPSHOT`
//!   inside the same transaction that produced it.

/// Engine bookkeeping table (snapshot number and future engine-scoped keys).
pub const TABLE_BOOKKEEPING: &str = "vantage";

/// Extension settings table: `(extension, key) -> value`, dynamically typed.
pub const TABLE_EXTENSION_SETTINGS: &str = "vantage_ext";

/// Row storage table.
pub const TABLE_ROWS: &str = "rows";

/// Bookkeeping key holding the committed snapshot number.
pub const BOOKKEEPING_SNAPSHOT: &str = "snapshot";

/// DDL applied at open. Idempotent.
pub const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS "vantage" (
    "key"   TEXT NOT NULL PRIMARY KEY,
    "value" INTEGER
);
CREATE TABLE IF NOT EXISTS "vantage_ext" (
    "extension" TEXT NOT NULL,
    "key"       TEXT NOT NULL,
    "value"     NOT NULL,
    PRIMARY KEY ("extension", "key")
);
CREATE TABLE IF NOT EXISTS "rows" (
    "key"      TEXT NOT NULL PRIMARY KEY,
    "data"     BLOB NOT NULL,
    "metadata" BLOB
);
"#;
