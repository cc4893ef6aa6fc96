//! Vantage - embedded transactional key/value store with ordered views
//!
//! Vantage stores rows (data plus optional metadata) in SQLite and layers a
//! snapshot/changeset engine on top: every connection reads a consistent
//! snapshot, writes are serialized through a per-database lock, and committed
//! changes fan out to sibling connections as changesets. Extensions hook the
//! write path to maintain derived structures; the built-in [`View`] extension
//! keeps rows grouped and sorted for paged, index-based access.
//!
//! # Quick Start
//!
//! ```ignore
//! use vantage::{Database, View, ViewAccess, ValueRead, ValueWrite};
//!
//! let db = Database::open("app.db")?;
//!
//! // Register a view that groups rows by key prefix.
//! let view = View::new(
//!     vantage::Grouping::by_key(|key| key.split(':').next().map(str::to_string)),
//!     vantage::Sorting::by_key(|_group, a, b| a.cmp(b)),
//! );
//! db.register_extension("by_prefix", view)?;
//!
//! let conn = db.connection()?;
//! conn.read_write(|txn| txn.put_value("user:alice", &42u32))?;
//! conn.read(|txn| {
//!     let mut view = txn.view("by_prefix")?;
//!     assert_eq!(view.len("user")?, 1);
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! The workspace splits along the same lines as the runtime:
//! - `vantage-core`: errors, settings values, changeset types
//! - `vantage-store`: the SQLite layer (schema, row CRUD, checkpointing)
//! - `vantage-engine`: database/connection/transaction machinery and the
//!   extension framework
//! - `vantage-view`: the ordered-view extension and UI mappings
//!
//! This crate re-exports the public surface of those layers and adds the
//! typed-value helpers ([`ValueRead`], [`ValueWrite`]) that encode rows with
//! `bincode`.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use vantage_engine::{
    BoundedCache, CacheStats, CommitNotification, Connection, ConnectionOptions, Database, Error,
    ExtContext, Extension, ExtensionChangeset, ExtensionConnection, ExtensionHandle,
    ExtensionPayload, ExtensionTransaction, FlushLevel, InternalChangeset, Options,
    ReadTransaction, Result, SettingValue, WriteTransaction, SNAPSHOT_UNSET,
};
pub use vantage_store::{CheckpointMode, CheckpointOutcome, JournalMode, StoreOptions, SyncMode};
pub use vantage_view::{
    DataGroupingFn, DataSortingFn, Grouping, KeyGroupingFn, KeySortingFn, Mappings,
    MetadataGroupingFn, MetadataSortingFn, RangePin, RowChange, RowGroupingFn, RowSortingFn,
    Sorting, View, ViewAccess, ViewChanges, ViewHandle, ViewOptions, ViewRange,
};

/// Typed reads layered over [`ReadTransaction::get`].
///
/// Rows are decoded with `bincode`. [`WriteTransaction`] reaches these
/// methods through its deref to [`ReadTransaction`].
pub trait ValueRead {
    /// Returns the row at `key` decoded as `T`, or `None` if the key is
    /// absent at this snapshot.
    fn get_value<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>>;
}

impl ValueRead for ReadTransaction<'_> {
    fn get_value<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(data) => {
                let value = bincode::deserialize(&data)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Typed writes layered over [`WriteTransaction::set`].
pub trait ValueWrite {
    /// Encodes `value` with `bincode` and stores it at `key` with no
    /// metadata.
    fn put_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()>;

    /// Encodes `value` with `bincode` and stores it at `key` alongside raw
    /// `metadata` bytes.
    fn put_value_with_metadata<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        metadata: &[u8],
    ) -> Result<()>;
}

impl ValueWrite for WriteTransaction<'_> {
    fn put_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let data =
            bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.set(key, &data, None)
    }

    fn put_value_with_metadata<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        metadata: &[u8],
    ) -> Result<()> {
        let data =
            bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.set(key, &data, Some(metadata))
    }
}
