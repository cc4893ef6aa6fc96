//! Database engine
//!
//! This crate ties the lower layers together:
//! - Database: shared snapshot state, changeset log, extension registry
//! - Connection: worker thread, row caches, changeset application
//! - Transactions: typed read/write surface with the commit pipeline
//! - Extension framework: row hooks and per-level extension state
//!
//! The engine is the only component that knows about:
//! - Snapshot numbering and the mid-commit catch-up rules
//! - Fan-out ordering between sibling connections
//! - Extension registration and orphan cleanup

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod connection;
mod database;
mod extension;
mod options;
mod transaction;
mod worker;

pub use cache::BoundedCache;
pub use connection::{CacheStats, Connection};
pub use database::Database;
pub use extension::{
    ExtContext, Extension, ExtensionChangeset, ExtensionConnection, ExtensionHandle,
    ExtensionTransaction,
};
pub use options::{ConnectionOptions, Options};
pub use transaction::{ReadTransaction, WriteTransaction};

pub use vantage_core::{
    CommitNotification, Error, ExtensionPayload, FlushLevel, InternalChangeset, Result,
    SettingValue, SNAPSHOT_UNSET,
};
