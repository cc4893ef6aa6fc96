//! Per-transaction view maintenance
//!
//! [`ViewTransaction`] receives the engine's row hooks and keeps the paged
//! index in step with the rows, buffering every page and mapping edit in
//! memory until `pre_commit` writes the delta to the view's tables. Reads go
//! through the same buffers, so a transaction always sees its own writes.
//!
//! Placement of a changed row is staged: rows the grouping rule rejects are
//! dropped outright, an unchanged sort position is detected by comparing
//! against the immediate neighbors, the group edges catch append-heavy
//! workloads, and only then does a binary search over the page chain run.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, info};
use vantage_core::{Error, ExtensionPayload, Result, SettingValue};
use vantage_engine::{ExtContext, ExtensionChangeset, ExtensionConnection, ExtensionTransaction};
use vantage_store::Store;

use crate::changes::{RowChange, ViewChanges};
use crate::extension::{Edge, ViewConnection, ViewCore, ViewInternalChangeset};
use crate::paging::{new_page_id, PageMeta};
use crate::rules::SortItem;

/// Setting key holding the version marker of the persisted index.
const SETTING_VERSION: &str = "version";

// ============================================================================
// Row access
// ============================================================================

/// Where row reads come from while maintaining the index.
///
/// Hooks read through the engine's cache-assisted context; the initial
/// populate runs straight against the store while enumerating it.
pub(crate) enum RowSource<'a, 'c> {
    Cached(&'a mut ExtContext<'c>),
    Raw(&'a Store),
}

impl<'a, 'c> RowSource<'a, 'c> {
    fn store(&self) -> &Store {
        match self {
            RowSource::Cached(ctx) => ctx.store(),
            RowSource::Raw(store) => store,
        }
    }

    fn data(&mut self, key: &str) -> Result<Option<Arc<[u8]>>> {
        match self {
            RowSource::Cached(ctx) => ctx.get_data(key),
            RowSource::Raw(store) => Ok(store.row_data(key)?.map(Arc::from)),
        }
    }

    fn metadata(&mut self, key: &str) -> Result<Option<Option<Arc<[u8]>>>> {
        match self {
            RowSource::Cached(ctx) => ctx.get_metadata(key),
            RowSource::Raw(store) => Ok(store.row_metadata(key)?.map(|m| m.map(Arc::from))),
        }
    }

    fn row(&mut self, key: &str) -> Result<Option<(Arc<[u8]>, Option<Arc<[u8]>>)>> {
        match self {
            RowSource::Cached(ctx) => ctx.get_row(key),
            RowSource::Raw(store) => Ok(store
                .row(key)?
                .map(|(data, metadata)| (Arc::from(data), metadata.map(Arc::from)))),
        }
    }
}

// ============================================================================
// Structure access helpers
// ============================================================================

/// A key's place in the index, in both page and global terms.
struct Location {
    group: String,
    page_id: String,
    /// Position within the page.
    offset: usize,
    /// Global position within the group.
    index: usize,
}

fn loaded_groups(core: &ViewCore) -> &HashMap<String, Vec<PageMeta>> {
    match core.group_pages.as_ref() {
        Some(groups) => groups,
        None => panic!("view '{}' used before its structure was loaded", core.name),
    }
}

fn loaded_groups_mut(core: &mut ViewCore) -> &mut HashMap<String, Vec<PageMeta>> {
    let name = core.name.as_str();
    match core.group_pages.as_mut() {
        Some(groups) => groups,
        None => panic!("view '{name}' used before its structure was loaded"),
    }
}

fn group_list<'a>(core: &'a ViewCore, group: &str) -> Option<&'a [PageMeta]> {
    loaded_groups(core).get(group).map(|list| list.as_slice())
}

fn group_list_mut<'a>(core: &'a mut ViewCore, group: &str) -> &'a mut Vec<PageMeta> {
    let name = core.name.as_str();
    match core.group_pages.as_mut() {
        Some(groups) => match groups.get_mut(group) {
            Some(list) => list,
            None => panic!("view '{name}': group '{group}' is not in the loaded structure"),
        },
        None => panic!("view '{name}' used before its structure was loaded"),
    }
}

fn set_page_count(core: &mut ViewCore, group: &str, page_id: &str, count: usize) {
    let list = group_list_mut(core, group);
    match list.iter_mut().find(|meta| meta.page_id == page_id) {
        Some(meta) => meta.count = count,
        None => panic!("view page '{page_id}' is missing from the chain of group '{group}'"),
    }
}

// ============================================================================
// Transaction state
// ============================================================================

/// View state while a transaction runs.
///
/// Owns the connection's [`ViewCore`] for the duration and layers the
/// not-yet-committed edits over it: rewritten page contents, dropped pages,
/// reassigned key mappings, and the groups whose chain shape changed.
pub(crate) struct ViewTransaction {
    core: ViewCore,
    /// Pages rewritten this transaction, content included.
    dirty_pages: HashMap<String, Arc<Vec<String>>>,
    /// Pages emptied and unlinked this transaction.
    dropped_pages: HashSet<String>,
    /// Key mapping changes; `None` removes the mapping.
    dirty_maps: HashMap<String, Option<String>>,
    /// Groups with any change at all; their pages get flushed.
    touched_groups: HashSet<String>,
    /// Groups whose chain gained, lost, or reordered pages; their clean
    /// pages need link and count fixups on flush.
    structural_groups: HashSet<String>,
    changes: Vec<RowChange>,
    /// The whole index was rebuilt or cleared; buffered state is the full
    /// truth and the committed tables are stale until `pre_commit`.
    reset: bool,
    disk_dirty: bool,
}

impl ViewTransaction {
    pub(crate) fn begin(core: ViewCore) -> Self {
        Self {
            core,
            dirty_pages: HashMap::new(),
            dropped_pages: HashSet::new(),
            dirty_maps: HashMap::new(),
            touched_groups: HashSet::new(),
            structural_groups: HashSet::new(),
            changes: Vec::new(),
            reset: false,
            disk_dirty: false,
        }
    }

    fn record(&mut self, change: RowChange) {
        // During a rebuild individual changes are meaningless; consumers get
        // the reset flag instead.
        if !self.reset {
            self.changes.push(change);
        }
    }

    /// Forgets everything and starts from an empty index.
    fn begin_reset(&mut self) {
        self.reset = true;
        self.disk_dirty = true;
        self.changes.clear();
        self.dirty_pages.clear();
        self.dropped_pages.clear();
        self.dirty_maps.clear();
        self.touched_groups.clear();
        self.structural_groups.clear();
        self.core.group_pages = Some(HashMap::new());
        self.core.page_group.clear();
        self.core.page_cache.clear();
        self.core.map_cache.clear();
        self.core.edges.clear();
    }

    // ------------------------------------------------------------------
    // Page and mapping reads through the transaction's buffers
    // ------------------------------------------------------------------

    /// The page a key is filed under, seeing this transaction's edits.
    fn page_of_key(&mut self, store: &Store, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.dirty_maps.get(key) {
            return Ok(entry.clone());
        }
        if self.reset {
            // The committed map table is stale; unbuffered keys are gone.
            return Ok(None);
        }
        if let Some(page_id) = self.core.map_cache.get(key) {
            return Ok(Some(page_id));
        }
        let fetched = self.core.sql.lookup_map(store.connection(), key)?;
        if let Some(page_id) = &fetched {
            self.core.map_cache.insert(key.to_string(), page_id.clone());
        }
        Ok(fetched)
    }

    /// A page's ordered keys, seeing this transaction's edits.
    fn load_page(&mut self, store: &Store, page_id: &str) -> Result<Arc<Vec<String>>> {
        if let Some(keys) = self.dirty_pages.get(page_id) {
            return Ok(Arc::clone(keys));
        }
        if self.reset {
            panic!("view page '{page_id}' is referenced but was not rebuilt");
        }
        if let Some(keys) = self.core.page_cache.get(page_id) {
            return Ok(keys);
        }
        let keys = match self.core.sql.load_page_keys(store.connection(), page_id)? {
            Some(keys) => Arc::new(keys),
            None => panic!("view page '{page_id}' is referenced but missing from the page table"),
        };
        self.core.page_cache.insert(page_id.to_string(), Arc::clone(&keys));
        Ok(keys)
    }

    /// Marks a page dirty and hands out its contents for editing. Shared
    /// contents are copied on first write; the connection cache keeps the
    /// committed version until the transaction commits.
    fn page_for_edit(&mut self, store: &Store, page_id: &str) -> Result<&mut Vec<String>> {
        let keys = self.load_page(store, page_id)?;
        let slot = self.dirty_pages.entry(page_id.to_string()).or_insert(keys);
        Ok(Arc::make_mut(slot))
    }

    fn locate(&mut self, store: &Store, key: &str) -> Result<Option<Location>> {
        let Some(page_id) = self.page_of_key(store, key)? else {
            return Ok(None);
        };
        let group = match self.core.page_group.get(&page_id) {
            Some(group) => group.clone(),
            None => panic!(
                "view '{}': key '{key}' maps to page '{page_id}' outside every chain",
                self.core.name
            ),
        };
        let keys = self.load_page(store, &page_id)?;
        let offset = match keys.iter().position(|k| k == key) {
            Some(offset) => offset,
            None => panic!("view page '{page_id}' does not contain key '{key}' as mapped"),
        };
        let mut index = offset;
        let mut found = false;
        match group_list(&self.core, &group) {
            Some(list) => {
                for meta in list {
                    if meta.page_id == page_id {
                        found = true;
                        break;
                    }
                    index += meta.count;
                }
            }
            None => panic!(
                "view '{}': group '{group}' vanished under key '{key}'",
                self.core.name
            ),
        }
        if !found {
            panic!("view page '{page_id}' is missing from the chain of group '{group}'");
        }
        Ok(Some(Location {
            group,
            page_id,
            offset,
            index,
        }))
    }

    fn group_len_loaded(&self, group: &str) -> usize {
        group_list(&self.core, group)
            .map(|list| list.iter().map(|meta| meta.count).sum())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Sort comparison inputs for an existing row, fetched per the sorting
    /// rule's arity.
    fn sort_inputs(
        &self,
        source: &mut RowSource<'_, '_>,
        key: &str,
    ) -> Result<(Option<Arc<[u8]>>, Option<Arc<[u8]>>)> {
        let mut data = None;
        let mut metadata = None;
        if self.core.sorting.needs_data() {
            data = Some(match source.data(key)? {
                Some(data) => data,
                None => panic!(
                    "view '{}': indexed row '{key}' no longer exists",
                    self.core.name
                ),
            });
        }
        if self.core.sorting.needs_metadata() {
            metadata = match source.metadata(key)? {
                Some(metadata) => metadata,
                None => panic!(
                    "view '{}': indexed row '{key}' no longer exists",
                    self.core.name
                ),
            };
        }
        Ok((data, metadata))
    }

    /// True when the row can stay where it is without breaking the order.
    fn fits_at(
        &mut self,
        source: &mut RowSource<'_, '_>,
        loc: &Location,
        key: &str,
        data: Option<&[u8]>,
        metadata: Option<&[u8]>,
    ) -> Result<bool> {
        let total = self.group_len_loaded(&loc.group);
        let candidate = SortItem { key, data, metadata };
        if loc.index > 0 {
            let pred_key = self.existing_key_at(source.store(), &loc.group, loc.index - 1)?;
            let (pred_data, pred_metadata) = self.sort_inputs(source, &pred_key)?;
            let pred = SortItem {
                key: &pred_key,
                data: pred_data.as_deref(),
                metadata: pred_metadata.as_deref(),
            };
            if self.core.sorting.compare(&loc.group, pred, candidate) == Ordering::Greater {
                return Ok(false);
            }
        }
        if loc.index + 1 < total {
            let succ_key = self.existing_key_at(source.store(), &loc.group, loc.index + 1)?;
            let (succ_data, succ_metadata) = self.sort_inputs(source, &succ_key)?;
            let succ = SortItem {
                key: &succ_key,
                data: succ_data.as_deref(),
                metadata: succ_metadata.as_deref(),
            };
            if self.core.sorting.compare(&loc.group, candidate, succ) == Ordering::Greater {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Global insertion index for a row entering a group.
    fn find_insert_index(
        &mut self,
        source: &mut RowSource<'_, '_>,
        group: &str,
        key: &str,
        data: Option<&[u8]>,
        metadata: Option<&[u8]>,
        total: usize,
    ) -> Result<usize> {
        if total == 0 {
            return Ok(0);
        }
        let candidate = SortItem { key, data, metadata };

        // Appending workloads keep hitting the same edge; one comparison
        // against the boundary row settles it.
        match self.core.edges.get(group).copied() {
            Some(Edge::Back) => {
                let last_key = self.existing_key_at(source.store(), group, total - 1)?;
                let (last_data, last_metadata) = self.sort_inputs(source, &last_key)?;
                let last = SortItem {
                    key: &last_key,
                    data: last_data.as_deref(),
                    metadata: last_metadata.as_deref(),
                };
                if self.core.sorting.compare(group, candidate, last) != Ordering::Less {
                    return Ok(total);
                }
            }
            Some(Edge::Front) => {
                let first_key = self.existing_key_at(source.store(), group, 0)?;
                let (first_data, first_metadata) = self.sort_inputs(source, &first_key)?;
                let first = SortItem {
                    key: &first_key,
                    data: first_data.as_deref(),
                    metadata: first_metadata.as_deref(),
                };
                if self.core.sorting.compare(group, candidate, first) == Ordering::Less {
                    return Ok(0);
                }
            }
            None => {}
        }

        // Upper-bound binary search; equal rows land after the last equal.
        let mut lo = 0usize;
        let mut hi = total;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe_key = self.existing_key_at(source.store(), group, mid)?;
            let (probe_data, probe_metadata) = self.sort_inputs(source, &probe_key)?;
            let probe = SortItem {
                key: &probe_key,
                data: probe_data.as_deref(),
                metadata: probe_metadata.as_deref(),
            };
            if self.core.sorting.compare(group, candidate, probe) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Inserts a key into a group at its sorted position, creating the group
    /// as needed, and returns the global index it landed on.
    fn insert_key_into_group(
        &mut self,
        source: &mut RowSource<'_, '_>,
        group: &str,
        key: &str,
        data: Option<&[u8]>,
        metadata: Option<&[u8]>,
    ) -> Result<usize> {
        self.touched_groups.insert(group.to_string());
        self.disk_dirty = true;

        if group_list(&self.core, group).is_none() {
            let page_id = new_page_id();
            loaded_groups_mut(&mut self.core).insert(
                group.to_string(),
                vec![PageMeta {
                    page_id: page_id.clone(),
                    count: 0,
                }],
            );
            self.core.page_group.insert(page_id.clone(), group.to_string());
            self.dirty_pages.insert(page_id, Arc::new(Vec::new()));
            self.structural_groups.insert(group.to_string());
            debug!(view = %self.core.name, group, "created group");
        }

        let total = self.group_len_loaded(group);
        let index = self.find_insert_index(source, group, key, data, metadata, total)?;
        self.insert_at(source.store(), group, index, key)?;

        if total == 0 {
            self.core.edges.remove(group);
        } else if index == 0 {
            self.core.edges.insert(group.to_string(), Edge::Front);
        } else if index == total {
            self.core.edges.insert(group.to_string(), Edge::Back);
        } else {
            self.core.edges.remove(group);
        }
        Ok(index)
    }

    /// Splices a key into the page covering a global index. The earlier page
    /// wins an index on a page boundary.
    fn insert_at(&mut self, store: &Store, group: &str, index: usize, key: &str) -> Result<()> {
        let (page_id, offset, page_pos) = {
            let list = match group_list(&self.core, group) {
                Some(list) => list,
                None => panic!(
                    "view '{}': group '{group}' vanished during an insert",
                    self.core.name
                ),
            };
            let mut acc = 0usize;
            let mut chosen = None;
            for (pos, meta) in list.iter().enumerate() {
                if index <= acc + meta.count {
                    chosen = Some((meta.page_id.clone(), index - acc, pos));
                    break;
                }
                acc += meta.count;
            }
            match chosen {
                Some(chosen) => chosen,
                None => panic!(
                    "view '{}': insert index {index} is beyond group '{group}'",
                    self.core.name
                ),
            }
        };
        let page = self.page_for_edit(store, &page_id)?;
        page.insert(offset, key.to_string());
        let new_len = page.len();
        set_page_count(&mut self.core, group, &page_id, new_len);
        self.dirty_maps.insert(key.to_string(), Some(page_id));
        if new_len > self.core.options.page_limit() {
            self.split_page(group, page_pos);
        }
        Ok(())
    }

    /// Moves the second half of an oversized page onto a fresh page linked
    /// right after it.
    fn split_page(&mut self, group: &str, page_pos: usize) {
        let left_id = group_list_mut(&mut self.core, group)[page_pos].page_id.clone();
        let (left_len, spill) = {
            let entry = match self.dirty_pages.get_mut(&left_id) {
                Some(entry) => entry,
                None => panic!("view page '{left_id}' split while clean"),
            };
            let keys = Arc::make_mut(entry);
            let spill = keys.split_off(keys.len() / 2);
            (keys.len(), spill)
        };
        let right_id = new_page_id();
        for key in &spill {
            self.dirty_maps.insert(key.clone(), Some(right_id.clone()));
        }
        let right_len = spill.len();
        self.dirty_pages.insert(right_id.clone(), Arc::new(spill));
        self.core.page_group.insert(right_id.clone(), group.to_string());
        {
            let list = group_list_mut(&mut self.core, group);
            list[page_pos].count = left_len;
            list.insert(
                page_pos + 1,
                PageMeta {
                    page_id: right_id.clone(),
                    count: right_len,
                },
            );
        }
        self.structural_groups.insert(group.to_string());
        debug!(view = %self.core.name, group, left = %left_id, right = %right_id, "split page");
    }

    /// Takes a key out of its page, unlinking the page when it empties and
    /// the group when its last page goes.
    fn remove_at(&mut self, store: &Store, loc: &Location, key: &str) -> Result<()> {
        self.touched_groups.insert(loc.group.clone());
        self.disk_dirty = true;
        let page = self.page_for_edit(store, &loc.page_id)?;
        if page.get(loc.offset).map(|k| k.as_str()) != Some(key) {
            panic!(
                "view page '{}' no longer holds key '{key}' at offset {}",
                loc.page_id, loc.offset
            );
        }
        page.remove(loc.offset);
        let new_len = page.len();
        set_page_count(&mut self.core, &loc.group, &loc.page_id, new_len);
        self.dirty_maps.insert(key.to_string(), None);
        self.core.edges.remove(&loc.group);
        if new_len == 0 {
            self.drop_page(&loc.group, &loc.page_id);
        }
        Ok(())
    }

    fn drop_page(&mut self, group: &str, page_id: &str) {
        self.dirty_pages.remove(page_id);
        self.dropped_pages.insert(page_id.to_string());
        self.core.page_group.remove(page_id);
        self.core.page_cache.remove(page_id);
        self.structural_groups.insert(group.to_string());
        let emptied = {
            let list = group_list_mut(&mut self.core, group);
            list.retain(|meta| meta.page_id != page_id);
            list.is_empty()
        };
        if emptied {
            loaded_groups_mut(&mut self.core).remove(group);
            debug!(view = %self.core.name, group, "group emptied");
        }
    }

    /// Settles a row whose group or sort inputs may have changed: leaves it,
    /// moves it, inserts it, or drops it, recording the change.
    fn re_place(
        &mut self,
        source: &mut RowSource<'_, '_>,
        key: &str,
        new_group: Option<String>,
        data: Option<&[u8]>,
        metadata: Option<&[u8]>,
        sort_inputs_changed: bool,
    ) -> Result<()> {
        let existing = self.locate(source.store(), key)?;
        match (existing, new_group) {
            (None, None) => Ok(()),
            (None, Some(group)) => {
                let index = self.insert_key_into_group(source, &group, key, data, metadata)?;
                self.record(RowChange::Insert {
                    group,
                    index,
                    key: key.to_string(),
                });
                Ok(())
            }
            (Some(loc), None) => {
                self.remove_at(source.store(), &loc, key)?;
                self.record(RowChange::Delete {
                    group: loc.group,
                    index: loc.index,
                    key: key.to_string(),
                });
                Ok(())
            }
            (Some(loc), Some(group)) if group != loc.group => {
                self.remove_at(source.store(), &loc, key)?;
                self.record(RowChange::Delete {
                    group: loc.group,
                    index: loc.index,
                    key: key.to_string(),
                });
                let to = self.insert_key_into_group(source, &group, key, data, metadata)?;
                self.record(RowChange::Insert {
                    group,
                    index: to,
                    key: key.to_string(),
                });
                Ok(())
            }
            (Some(loc), Some(group)) => {
                if !sort_inputs_changed || self.fits_at(source, &loc, key, data, metadata)? {
                    self.record(RowChange::Update {
                        group,
                        index: loc.index,
                        key: key.to_string(),
                    });
                    return Ok(());
                }
                self.remove_at(source.store(), &loc, key)?;
                let to = self.insert_key_into_group(source, &group, key, data, metadata)?;
                self.record(RowChange::Move {
                    group,
                    from: loc.index,
                    to,
                    key: key.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Rebuilds the whole index from the store's rows.
    fn populate(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        self.begin_reset();
        let needs_data = self.core.grouping.needs_data() || self.core.sorting.needs_data();
        let needs_metadata =
            self.core.grouping.needs_metadata() || self.core.sorting.needs_metadata();
        let store = ctx.store();
        let mut failure: Option<Error> = None;
        {
            let mut place = |key: &str, data: Option<&[u8]>, metadata: Option<&[u8]>| -> bool {
                let group = match self.core.grouping.group(key, data, metadata) {
                    Some(group) => group,
                    None => return true,
                };
                let mut source = RowSource::Raw(store);
                match self.insert_key_into_group(&mut source, &group, key, data, metadata) {
                    Ok(_) => true,
                    Err(error) => {
                        failure = Some(error);
                        false
                    }
                }
            };
            let outcome = match (needs_data, needs_metadata) {
                (true, true) => {
                    store.enumerate_rows(|_, key, data, metadata| place(key, Some(data), metadata))
                }
                (true, false) => {
                    store.enumerate_keys_and_data(|_, key, data| place(key, Some(data), None))
                }
                (false, true) => store
                    .enumerate_keys_and_metadata(|_, key, metadata| place(key, None, metadata)),
                (false, false) => store.enumerate_keys(|_, key| place(key, None, None)),
            };
            outcome?;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        let groups = loaded_groups(&self.core);
        let rows: usize = groups
            .values()
            .map(|list| list.iter().map(|meta| meta.count).sum::<usize>())
            .sum();
        info!(view = %self.core.name, rows, groups = groups.len(), "view populated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query surface, used by the transaction-scoped handle
    // ------------------------------------------------------------------

    pub(crate) fn group_count(&self) -> usize {
        loaded_groups(&self.core).len()
    }

    /// Group names, alphabetical for a stable answer.
    pub(crate) fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = loaded_groups(&self.core).keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn group_len(&self, group: &str) -> usize {
        self.group_len_loaded(group)
    }

    pub(crate) fn total_len(&self) -> usize {
        loaded_groups(&self.core)
            .values()
            .map(|list| list.iter().map(|meta| meta.count).sum::<usize>())
            .sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub(crate) fn key_at(
        &mut self,
        store: &Store,
        group: &str,
        index: usize,
    ) -> Result<Option<String>> {
        let target = {
            let Some(list) = group_list(&self.core, group) else {
                return Ok(None);
            };
            let mut acc = 0usize;
            let mut target = None;
            for meta in list {
                if index < acc + meta.count {
                    target = Some((meta.page_id.clone(), index - acc));
                    break;
                }
                acc += meta.count;
            }
            target
        };
        let Some((page_id, offset)) = target else {
            return Ok(None);
        };
        let keys = self.load_page(store, &page_id)?;
        match keys.get(offset) {
            Some(key) => Ok(Some(key.clone())),
            None => panic!("view page '{page_id}' count disagrees with its key blob"),
        }
    }

    fn existing_key_at(&mut self, store: &Store, group: &str, index: usize) -> Result<String> {
        match self.key_at(store, group, index)? {
            Some(key) => Ok(key),
            None => panic!(
                "view '{}': index {index} is out of bounds in group '{group}'",
                self.core.name
            ),
        }
    }

    pub(crate) fn index_of(
        &mut self,
        store: &Store,
        key: &str,
    ) -> Result<Option<(String, usize)>> {
        Ok(self.locate(store, key)?.map(|loc| (loc.group, loc.index)))
    }

    pub(crate) fn contains_key(&mut self, store: &Store, key: &str) -> Result<bool> {
        Ok(self.page_of_key(store, key)?.is_some())
    }

    /// Walks a group in order, feeding `f` each global index and key until it
    /// returns false. `range` clamps to the group, `reversed` walks backwards.
    pub(crate) fn enumerate_range(
        &mut self,
        store: &Store,
        group: &str,
        range: Option<Range<usize>>,
        reversed: bool,
        mut f: impl FnMut(usize, &str) -> bool,
    ) -> Result<()> {
        let spans: Vec<(String, usize, usize)> = {
            let Some(list) = group_list(&self.core, group) else {
                return Ok(());
            };
            let mut acc = 0usize;
            list.iter()
                .map(|meta| {
                    let span = (meta.page_id.clone(), acc, meta.count);
                    acc += meta.count;
                    span
                })
                .collect()
        };
        let total = spans
            .last()
            .map(|(_, start, count)| start + count)
            .unwrap_or(0);
        let (lo, hi) = match range {
            Some(range) => (range.start.min(total), range.end.min(total)),
            None => (0, total),
        };
        if lo >= hi {
            return Ok(());
        }
        if !reversed {
            for (page_id, start, count) in &spans {
                if *start >= hi {
                    break;
                }
                let page_lo = lo.max(*start);
                let page_hi = hi.min(start + count);
                if page_lo >= page_hi {
                    continue;
                }
                let keys = self.load_page(store, page_id)?;
                for pos in page_lo..page_hi {
                    if !f(pos, &keys[pos - start]) {
                        return Ok(());
                    }
                }
            }
        } else {
            for (page_id, start, count) in spans.iter().rev() {
                if start + count <= lo {
                    break;
                }
                let page_lo = lo.max(*start);
                let page_hi = hi.min(start + count);
                if page_lo >= page_hi {
                    continue;
                }
                let keys = self.load_page(store, page_id)?;
                for pos in (page_lo..page_hi).rev() {
                    if !f(pos, &keys[pos - start]) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Hook wiring
// ============================================================================

impl ExtensionTransaction for ViewTransaction {
    /// Builds the index tables and populates them from existing rows. A
    /// changed version marker, missing tables, or a non-persistent view all
    /// force a rebuild.
    fn create_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        let stored = ctx.get_setting(SETTING_VERSION)?.and_then(|v| v.as_int());
        let current = self.core.options.version;
        let intact = self.core.options.persistent
            && stored == Some(current)
            && ctx.store().table_exists(self.core.sql.map_table())?;
        if intact {
            debug!(view = %self.core.name, version = current, "persisted view index is current");
            return Ok(());
        }
        info!(
            view = %self.core.name,
            version = current,
            persistent = self.core.options.persistent,
            "building view index"
        );
        ctx.store().execute_ddl(&self.core.sql.drop_tables_sql())?;
        ctx.store().execute_ddl(&self.core.sql.create_tables_sql())?;
        ctx.set_setting(SETTING_VERSION, &SettingValue::Int(current))?;
        self.populate(ctx)?;
        Ok(())
    }

    fn prepare_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        if self.core.group_pages.is_some() {
            return Ok(());
        }
        let records = self.core.sql.load_structure(ctx.store().connection())?;
        let total = records.len();
        let mut referenced = HashSet::new();
        for record in &records {
            if let Some(next) = &record.next_page_id {
                referenced.insert(next.clone());
            }
        }
        let mut by_id: HashMap<String, (String, Option<String>, usize)> = HashMap::new();
        let mut heads = Vec::new();
        for record in records {
            if !referenced.contains(&record.page_id) {
                heads.push(record.page_id.clone());
            }
            by_id.insert(record.page_id, (record.group, record.next_page_id, record.count));
        }
        let mut group_pages: HashMap<String, Vec<PageMeta>> = HashMap::new();
        let mut page_group = HashMap::new();
        let mut placed = 0usize;
        for head in heads {
            let group = match by_id.get(&head) {
                Some((group, _, _)) => group.clone(),
                None => continue,
            };
            if group_pages.contains_key(&group) {
                panic!(
                    "view '{}': group '{group}' has more than one chain head",
                    self.core.name
                );
            }
            let mut chain = Vec::new();
            let mut current = Some(head);
            while let Some(page_id) = current {
                if page_group.contains_key(&page_id) {
                    panic!("view '{}': page '{page_id}' is linked twice", self.core.name);
                }
                let (owner, next, count) = match by_id.get(&page_id) {
                    Some(entry) => entry,
                    None => panic!(
                        "view '{}': chain of group '{group}' links to missing page '{page_id}'",
                        self.core.name
                    ),
                };
                if *owner != group {
                    panic!(
                        "view '{}': chain of group '{group}' crosses into group '{owner}'",
                        self.core.name
                    );
                }
                chain.push(PageMeta {
                    page_id: page_id.clone(),
                    count: *count,
                });
                page_group.insert(page_id, group.clone());
                placed += 1;
                current = next.clone();
            }
            group_pages.insert(group, chain);
        }
        if placed != total {
            panic!(
                "view '{}': {} pages belong to no chain",
                self.core.name,
                total - placed
            );
        }
        debug!(view = %self.core.name, groups = group_pages.len(), pages = placed, "loaded view structure");
        self.core.group_pages = Some(group_pages);
        self.core.page_group = page_group;
        Ok(())
    }

    fn on_insert(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        _rowid: i64,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let Some(group) = self.core.grouping.group(key, Some(data), metadata) else {
            return Ok(());
        };
        let mut source = RowSource::Cached(ctx);
        let index = self.insert_key_into_group(&mut source, &group, key, Some(data), metadata)?;
        self.record(RowChange::Insert {
            group,
            index,
            key: key.to_string(),
        });
        Ok(())
    }

    fn on_update(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        _rowid: i64,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let group = self.core.grouping.group(key, Some(data), metadata);
        let sort_inputs_changed =
            self.core.sorting.needs_data() || self.core.sorting.needs_metadata();
        let mut source = RowSource::Cached(ctx);
        self.re_place(&mut source, key, group, Some(data), metadata, sort_inputs_changed)
    }

    fn on_update_metadata_only(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        _rowid: i64,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let grouping_reads = self.core.grouping.needs_metadata();
        let sorting_reads = self.core.sorting.needs_metadata();
        let mut source = RowSource::Cached(ctx);
        if !grouping_reads && !sorting_reads {
            // Neither membership nor position can have changed.
            if let Some(loc) = self.locate(source.store(), key)? {
                let change = RowChange::Update {
                    group: loc.group,
                    index: loc.index,
                    key: key.to_string(),
                };
                self.record(change);
            }
            return Ok(());
        }
        let needs_data = self.core.grouping.needs_data() || self.core.sorting.needs_data();
        let data = if needs_data {
            Some(match source.data(key)? {
                Some(data) => data,
                None => panic!("updated row '{key}' cannot be read back"),
            })
        } else {
            None
        };
        let group = self.core.grouping.group(key, data.as_deref(), metadata);
        self.re_place(&mut source, key, group, data.as_deref(), metadata, sorting_reads)
    }

    fn on_touch(&mut self, ctx: &mut ExtContext<'_>, key: &str, _rowid: i64) -> Result<()> {
        let needs_data = self.core.grouping.needs_data() || self.core.sorting.needs_data();
        let needs_metadata =
            self.core.grouping.needs_metadata() || self.core.sorting.needs_metadata();
        let mut source = RowSource::Cached(ctx);
        let mut data = None;
        let mut metadata = None;
        if needs_data && needs_metadata {
            match source.row(key)? {
                Some((d, m)) => {
                    data = Some(d);
                    metadata = m;
                }
                None => panic!("touched row '{key}' cannot be read back"),
            }
        } else if needs_data {
            data = Some(match source.data(key)? {
                Some(d) => d,
                None => panic!("touched row '{key}' cannot be read back"),
            });
        } else if needs_metadata {
            metadata = match source.metadata(key)? {
                Some(m) => m,
                None => panic!("touched row '{key}' cannot be read back"),
            };
        }
        let group = self.core.grouping.group(key, data.as_deref(), metadata.as_deref());
        // A touch changes no values, so a row staying in its group keeps its
        // position by definition.
        self.re_place(&mut source, key, group, data.as_deref(), metadata.as_deref(), false)
    }

    fn on_remove(&mut self, ctx: &mut ExtContext<'_>, key: &str, _rowid: i64) -> Result<()> {
        let mut source = RowSource::Cached(ctx);
        let Some(loc) = self.locate(source.store(), key)? else {
            return Ok(());
        };
        self.remove_at(source.store(), &loc, key)?;
        self.record(RowChange::Delete {
            group: loc.group,
            index: loc.index,
            key: key.to_string(),
        });
        Ok(())
    }

    fn on_remove_many(&mut self, ctx: &mut ExtContext<'_>, rows: &[(String, i64)]) -> Result<()> {
        let mut source = RowSource::Cached(ctx);
        for (key, _rowid) in rows {
            let Some(loc) = self.locate(source.store(), key)? else {
                continue;
            };
            self.remove_at(source.store(), &loc, key)?;
            self.record(RowChange::Delete {
                group: loc.group,
                index: loc.index,
                key: key.clone(),
            });
        }
        Ok(())
    }

    fn on_remove_all(&mut self, _ctx: &mut ExtContext<'_>) -> Result<()> {
        self.begin_reset();
        Ok(())
    }

    /// Writes the buffered delta to the view's tables: dropped pages go,
    /// dirty pages are rewritten wholesale, clean pages in reshaped chains
    /// get their links and counts fixed, and the mappings follow.
    fn pre_commit(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        if !self.disk_dirty {
            return Ok(());
        }
        let conn = ctx.store().connection();
        if self.reset {
            self.core.sql.clear(conn)?;
        }
        for page_id in &self.dropped_pages {
            self.core.sql.delete_page(conn, page_id)?;
        }
        let groups = loaded_groups(&self.core);
        for group in &self.touched_groups {
            let Some(list) = groups.get(group) else {
                continue;
            };
            let structural = self.structural_groups.contains(group);
            for (pos, meta) in list.iter().enumerate() {
                let next = list.get(pos + 1).map(|m| m.page_id.as_str());
                if let Some(keys) = self.dirty_pages.get(&meta.page_id) {
                    self.core
                        .sql
                        .write_page(conn, &meta.page_id, group, next, keys.as_slice())?;
                } else if structural {
                    self.core
                        .sql
                        .update_page_link(conn, &meta.page_id, next, meta.count)?;
                }
            }
        }
        for (key, target) in &self.dirty_maps {
            match target {
                Some(page_id) => self.core.sql.set_map(conn, key, page_id)?,
                None => self.core.sql.delete_map(conn, key)?,
            }
        }
        debug!(
            view = %self.core.name,
            pages = self.dirty_pages.len(),
            dropped = self.dropped_pages.len(),
            maps = self.dirty_maps.len(),
            reset = self.reset,
            "view delta written"
        );
        Ok(())
    }

    fn changeset(&mut self) -> ExtensionChangeset {
        if !self.disk_dirty && self.changes.is_empty() {
            return ExtensionChangeset::default();
        }
        let internal: Option<ExtensionPayload> = if self.disk_dirty {
            let (groups, pages, dropped_pages, maps) = if self.reset {
                (HashMap::new(), HashMap::new(), Vec::new(), HashMap::new())
            } else {
                let loaded = loaded_groups(&self.core);
                let groups = self
                    .touched_groups
                    .iter()
                    .map(|group| {
                        (
                            group.clone(),
                            loaded.get(group).cloned().unwrap_or_default(),
                        )
                    })
                    .collect();
                let pages = self
                    .dirty_pages
                    .iter()
                    .map(|(page_id, keys)| (page_id.clone(), Arc::clone(keys)))
                    .collect();
                (
                    groups,
                    pages,
                    self.dropped_pages.iter().cloned().collect(),
                    self.dirty_maps.clone(),
                )
            };
            Some(Arc::new(ViewInternalChangeset {
                reset: self.reset,
                groups,
                pages,
                dropped_pages,
                maps,
            }))
        } else {
            None
        };
        let external: Option<ExtensionPayload> = Some(Arc::new(ViewChanges {
            changes: mem::take(&mut self.changes),
            reset: self.reset,
        }));
        ExtensionChangeset {
            internal,
            external,
            has_disk_changes: self.disk_dirty,
        }
    }

    /// Folds the delta into the connection caches; the structure was kept
    /// current all along.
    fn commit(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        let mut this = *self;
        for (page_id, keys) in this.dirty_pages.drain() {
            this.core.page_cache.insert(page_id, keys);
        }
        for page_id in this.dropped_pages.drain() {
            this.core.page_cache.remove(page_id.as_str());
        }
        for (key, target) in this.dirty_maps.drain() {
            match target {
                Some(page_id) => {
                    this.core.map_cache.insert(key, page_id);
                }
                None => {
                    this.core.map_cache.remove(key.as_str());
                }
            }
        }
        Box::new(ViewConnection { core: this.core })
    }

    /// The buffered delta dies with the transaction. The loaded structure
    /// and caches were patched along the way, so they go too.
    fn rollback(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        let mut this = *self;
        this.core.group_pages = None;
        this.core.page_group.clear();
        this.core.page_cache.clear();
        this.core.map_cache.clear();
        this.core.edges.clear();
        Box::new(ViewConnection { core: this.core })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
