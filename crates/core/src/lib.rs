//! Core types for the vantage engine
//!
//! This crate defines the vocabulary shared by every layer of the system:
//! - Error: the error taxonomy, split by how callers are expected to react
//! - Changesets: the record of one committed write transaction, in both its
//!   rich internal form (fanned out to sibling connections) and its immutable
//!   external form (delivered to commit observers)
//! - FlushLevel: graduated memory-pressure response
//! - SettingValue: dynamically typed extension settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changeset;
pub mod error;
pub mod types;

pub use changeset::{CommitNotification, ExtensionPayload, InternalChangeset};
pub use error::{Error, Result};
pub use types::{FlushLevel, SettingValue, SNAPSHOT_UNSET};
