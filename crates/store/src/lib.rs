//! SQLite binding for the vantage engine
//!
//! Everything that talks to the backing store lives here: opening and
//! configuring a connection, the core schema, row and settings DML, WAL
//! checkpointing, and the busy/contention classification the engine's retry
//! paths rely on.
//!
//! The relational engine itself is an external collaborator; this crate wraps
//! `rusqlite` and never reimplements storage.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod options;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use options::{JournalMode, StoreOptions, SyncMode};
pub use store::{CheckpointMode, CheckpointOutcome, Store};
