//! Transaction-scoped view queries
//!
//! [`ViewAccess::view`] opens a [`ViewHandle`] on any transaction, read or
//! write. The handle answers against the transaction's snapshot, and inside
//! a write transaction it sees that transaction's own uncommitted changes.

use std::ops::Range;
use std::sync::Arc;

use vantage_core::{Error, Result};
use vantage_engine::{ExtContext, ReadTransaction};

use crate::transaction::ViewTransaction;

/// Entry point for view queries, implemented on [`ReadTransaction`] and
/// reachable from write transactions through deref.
pub trait ViewAccess<'t> {
    /// Opens the query surface of the view registered under `name`.
    ///
    /// Fails when nothing is registered under the name or the extension
    /// there is not a view.
    fn view<'v>(&'v mut self, name: &str) -> Result<ViewHandle<'v, 't>>;
}

impl<'t> ViewAccess<'t> for ReadTransaction<'t> {
    fn view<'v>(&'v mut self, name: &str) -> Result<ViewHandle<'v, 't>> {
        let probe = self.with_extension(name, |ext, _ctx| {
            ext.as_any_mut().downcast_mut::<ViewTransaction>().is_some()
        })?;
        match probe {
            Some(true) => Ok(ViewHandle {
                txn: self,
                name: name.to_string(),
            }),
            Some(false) => Err(Error::config(format!("extension '{name}' is not a view"))),
            None => Err(Error::config(format!("no view is registered under '{name}'"))),
        }
    }
}

/// Queries against one view, bound to one transaction.
///
/// Indices are global positions within a group, `0` being the first row in
/// sort order. Methods take `&mut self` because answers can fault pages into
/// the connection caches.
pub struct ViewHandle<'v, 't> {
    txn: &'v mut ReadTransaction<'t>,
    name: String,
}

impl<'v, 't> ViewHandle<'v, 't> {
    fn with<R>(
        &mut self,
        f: impl FnOnce(&mut ViewTransaction, &mut ExtContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let result = self.txn.with_extension(&self.name, |ext, ctx| {
            match ext.as_any_mut().downcast_mut::<ViewTransaction>() {
                Some(view) => f(view, ctx),
                None => panic!("extension changed type under a view handle"),
            }
        })?;
        match result {
            Some(answer) => answer,
            None => panic!("view '{}' disappeared mid-transaction", self.name),
        }
    }

    /// The name the view is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of groups currently holding at least one row.
    pub fn group_count(&mut self) -> Result<usize> {
        self.with(|view, _ctx| Ok(view.group_count()))
    }

    /// Group names, alphabetical.
    pub fn groups(&mut self) -> Result<Vec<String>> {
        self.with(|view, _ctx| Ok(view.group_names()))
    }

    /// Number of rows in one group; zero for unknown groups.
    pub fn len(&mut self, group: &str) -> Result<usize> {
        self.with(|view, _ctx| Ok(view.group_len(group)))
    }

    /// Number of rows across all groups.
    pub fn total_len(&mut self) -> Result<usize> {
        self.with(|view, _ctx| Ok(view.total_len()))
    }

    /// True when no group holds any row.
    pub fn is_empty(&mut self) -> Result<bool> {
        self.with(|view, _ctx| Ok(view.is_empty()))
    }

    /// The key at a global index within a group.
    pub fn key_at(&mut self, group: &str, index: usize) -> Result<Option<String>> {
        self.with(|view, ctx| view.key_at(ctx.store(), group, index))
    }

    /// The first key of a group in sort order.
    pub fn first_key(&mut self, group: &str) -> Result<Option<String>> {
        self.with(|view, ctx| view.key_at(ctx.store(), group, 0))
    }

    /// The last key of a group in sort order.
    pub fn last_key(&mut self, group: &str) -> Result<Option<String>> {
        self.with(|view, ctx| {
            let len = view.group_len(group);
            if len == 0 {
                return Ok(None);
            }
            view.key_at(ctx.store(), group, len - 1)
        })
    }

    /// Where a key sits in the view, if it is in the view at all.
    pub fn index_of(&mut self, key: &str) -> Result<Option<(String, usize)>> {
        self.with(|view, ctx| view.index_of(ctx.store(), key))
    }

    /// True when the view holds the key.
    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        self.with(|view, ctx| view.contains_key(ctx.store(), key))
    }

    /// The row data behind the key at a global index, read through the
    /// connection's row cache.
    pub fn data_at(&mut self, group: &str, index: usize) -> Result<Option<Arc<[u8]>>> {
        self.with(|view, ctx| {
            let Some(key) = view.key_at(ctx.store(), group, index)? else {
                return Ok(None);
            };
            ctx.get_data(&key)
        })
    }

    /// Walks a whole group in sort order until `f` returns false.
    pub fn enumerate_keys(
        &mut self,
        group: &str,
        mut f: impl FnMut(usize, &str) -> bool,
    ) -> Result<()> {
        self.with(|view, ctx| view.enumerate_range(ctx.store(), group, None, false, &mut f))
    }

    /// Walks a window of a group, optionally backwards. The range is clamped
    /// to the group's length; `f` still receives global indices.
    pub fn enumerate_keys_range(
        &mut self,
        group: &str,
        range: Range<usize>,
        reversed: bool,
        mut f: impl FnMut(usize, &str) -> bool,
    ) -> Result<()> {
        self.with(|view, ctx| {
            view.enumerate_range(ctx.store(), group, Some(range), reversed, &mut f)
        })
    }
}
