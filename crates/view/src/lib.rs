//! Grouped, sorted, persistent indexes over the row store
//!
//! - register a [`View`] to keep rows grouped and sorted by caller rules,
//!   maintained incrementally from the engine's commit hooks
//! - the index lives in sqlite pages alongside the rows, committing
//!   atomically with them and surviving restarts
//! - query by group, index, and range through [`ViewAccess`] inside any
//!   transaction, at that transaction's snapshot
//! - subscribe to per-commit [`ViewChanges`] for animated list updates, and
//!   project sections and rows through [`Mappings`]

#![warn(missing_docs)]
#![warn(clippy::all)]

mod changes;
mod extension;
mod handle;
mod mappings;
mod options;
mod paging;
mod rules;
mod transaction;

pub use changes::{RowChange, ViewChanges};
pub use extension::View;
pub use handle::{ViewAccess, ViewHandle};
pub use mappings::{Mappings, RangePin, ViewRange};
pub use options::ViewOptions;
pub use rules::{
    DataGroupingFn, DataSortingFn, Grouping, KeyGroupingFn, KeySortingFn, MetadataGroupingFn,
    MetadataSortingFn, RowGroupingFn, RowSortingFn, Sorting,
};
