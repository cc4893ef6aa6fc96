//! The view extension
//!
//! A [`View`] keeps every row that its grouping rule accepts in a persistent
//! ordered index, split into groups and sorted within each by the sorting
//! rule. The index survives restarts (subject to [`ViewOptions`]) and is
//! maintained incrementally from the engine's row hooks.
//!
//! Per-connection state mirrors the engine's own caching model: the loaded
//! chain structure plus bounded caches of page contents and key-to-page
//! mappings, all patched in place when sibling commits fan out.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use vantage_core::{ExtensionPayload, FlushLevel};
use vantage_engine::{BoundedCache, Extension, ExtensionConnection, ExtensionTransaction};

use crate::options::ViewOptions;
use crate::paging::{PageMeta, ViewSql};
use crate::rules::{Grouping, Sorting};
use crate::transaction::ViewTransaction;

/// Page contents cached per connection.
const PAGE_CACHE_LIMIT: usize = 64;
/// Key-to-page mappings cached per connection.
const MAP_CACHE_LIMIT: usize = 256;

/// Which end of a group the last insert landed on.
///
/// Feeds the edge-append heuristic: ordered bulk loads keep hitting the same
/// edge, and one comparison against the boundary row beats a binary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Front,
    Back,
}

/// An ordered, grouped index over the store's rows.
///
/// Register one under a name with
/// [`Database::register_extension`](vantage_engine::Database::register_extension),
/// then query it through [`ViewAccess::view`](crate::ViewAccess::view) inside
/// any transaction on that database.
pub struct View {
    grouping: Grouping,
    sorting: Sorting,
    options: ViewOptions,
}

impl View {
    /// Creates a view with default options.
    pub fn new(grouping: Grouping, sorting: Sorting) -> Self {
        Self::with_options(grouping, sorting, ViewOptions::default())
    }

    /// Creates a view with explicit options.
    pub fn with_options(grouping: Grouping, sorting: Sorting, options: ViewOptions) -> Self {
        Self {
            grouping,
            sorting,
            options,
        }
    }

    /// The options this view was built with.
    pub fn options(&self) -> &ViewOptions {
        &self.options
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("grouping", &self.grouping)
            .field("sorting", &self.sorting)
            .field("options", &self.options)
            .finish()
    }
}

impl Extension for View {
    fn class_name(&self) -> &'static str {
        "view"
    }

    fn table_names(&self, name: &str) -> Vec<String> {
        let sql = ViewSql::new(name);
        vec![sql.map_table().to_string(), sql.page_table().to_string()]
    }

    fn new_connection_state(&self, name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(ViewConnection {
            core: ViewCore::new(
                name,
                self.grouping.clone(),
                self.sorting.clone(),
                self.options.clone(),
            ),
        })
    }
}

/// Structure patch fanned out to sibling connections after a commit.
///
/// Carries full replacement page lists per affected group (an empty list
/// means the group is gone), rewritten page contents for cache patching, and
/// the key mappings that changed. `reset` supersedes everything else.
pub(crate) struct ViewInternalChangeset {
    pub(crate) reset: bool,
    pub(crate) groups: HashMap<String, Vec<PageMeta>>,
    pub(crate) pages: HashMap<String, Arc<Vec<String>>>,
    pub(crate) dropped_pages: Vec<String>,
    pub(crate) maps: HashMap<String, Option<String>>,
}

/// Everything one connection knows about one view.
///
/// Owned by [`ViewConnection`] between transactions and moved into the
/// transaction-level state while one runs.
pub(crate) struct ViewCore {
    pub(crate) name: String,
    pub(crate) sql: ViewSql,
    pub(crate) grouping: Grouping,
    pub(crate) sorting: Sorting,
    pub(crate) options: ViewOptions,
    /// Group name to ordered page chain. `None` until loaded.
    pub(crate) group_pages: Option<HashMap<String, Vec<PageMeta>>>,
    /// Owning group of every page in the loaded structure.
    pub(crate) page_group: HashMap<String, String>,
    /// Committed page contents.
    pub(crate) page_cache: BoundedCache<String, Arc<Vec<String>>>,
    /// Committed key-to-page mappings.
    pub(crate) map_cache: BoundedCache<String, String>,
    /// Edge-append hints, one per group.
    pub(crate) edges: HashMap<String, Edge>,
}

impl ViewCore {
    pub(crate) fn new(
        name: &str,
        grouping: Grouping,
        sorting: Sorting,
        options: ViewOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            sql: ViewSql::new(name),
            grouping,
            sorting,
            options,
            group_pages: None,
            page_group: HashMap::new(),
            page_cache: BoundedCache::new(PAGE_CACHE_LIMIT),
            map_cache: BoundedCache::new(MAP_CACHE_LIMIT),
            edges: HashMap::new(),
        }
    }

    /// Patches the loaded structure and caches with a sibling's commit.
    ///
    /// Caches are corrected or evicted, never grown; a connection that never
    /// loaded the structure skips the group patch entirely and will reload
    /// on demand.
    pub(crate) fn apply_internal(&mut self, changes: &ViewInternalChangeset) {
        self.edges.clear();
        if changes.reset {
            self.group_pages = None;
            self.page_group.clear();
            self.page_cache.clear();
            self.map_cache.clear();
            return;
        }
        for (key, target) in &changes.maps {
            match target {
                Some(page_id) => self.map_cache.update_if_present(key.as_str(), page_id.clone()),
                None => {
                    self.map_cache.remove(key.as_str());
                }
            }
        }
        for page_id in &changes.dropped_pages {
            self.page_cache.remove(page_id.as_str());
        }
        for (page_id, keys) in &changes.pages {
            self.page_cache.update_if_present(page_id.as_str(), Arc::clone(keys));
        }
        if let Some(group_pages) = self.group_pages.as_mut() {
            for (group, list) in &changes.groups {
                if let Some(old) = group_pages.get(group) {
                    for meta in old {
                        self.page_group.remove(&meta.page_id);
                    }
                }
                if list.is_empty() {
                    group_pages.remove(group);
                } else {
                    for meta in list {
                        self.page_group.insert(meta.page_id.clone(), group.clone());
                    }
                    group_pages.insert(group.clone(), list.clone());
                }
            }
        }
    }

    /// Releases memory per the engine's flush levels.
    pub(crate) fn flush(&mut self, level: FlushLevel) {
        self.edges.clear();
        if level >= FlushLevel::Moderate {
            self.page_cache.clear();
            self.map_cache.clear();
        }
        if level >= FlushLevel::Full {
            self.group_pages = None;
            self.page_group.clear();
        }
    }
}

/// Per-connection view state between transactions.
pub(crate) struct ViewConnection {
    pub(crate) core: ViewCore,
}

impl ExtensionConnection for ViewConnection {
    fn begin(self: Box<Self>, _read_write: bool) -> Box<dyn ExtensionTransaction> {
        Box::new(ViewTransaction::begin(self.core))
    }

    fn apply_changeset(&mut self, payload: &ExtensionPayload) {
        match payload.downcast_ref::<ViewInternalChangeset>() {
            Some(changes) => self.core.apply_internal(changes),
            None => debug!(view = %self.core.name, "ignoring changeset payload of a foreign type"),
        }
    }

    fn flush(&mut self, level: FlushLevel) {
        self.core.flush(level);
    }
}
