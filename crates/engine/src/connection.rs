//! Connection layer.
//!
//! A [`Connection`] is a handle onto a dedicated worker thread that owns one
//! sqlite handle, two row caches and the per-connection extension state. All
//! transactions run as jobs on that thread, so everything here is single
//! threaded once inside a job; the only cross-thread traffic is the job queue
//! itself.
//!
//! Each connection tracks the snapshot number it has caught up to. Sibling
//! commits arrive as queued changeset jobs and are folded into the caches
//! before any later transaction runs, which keeps the caches exactly as fresh
//! as the sqlite snapshot the next transaction will see.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use vantage_core::{
    CommitNotification, ExtensionPayload, FlushLevel, InternalChangeset, Result,
};
use vantage_store::Store;

use crate::cache::BoundedCache;
use crate::database::{Database, DatabaseInner};
use crate::extension::{
    registry_from_payload, registry_payload, ExtContext, Extension, ExtensionConnection,
    ExtensionRegistry, ExtensionTransaction,
};
use crate::transaction::{ReadTransaction, WriteTransaction};
use crate::worker::SerialQueue;

// ============================================================================
// Pending changes
// ============================================================================

/// Changes recorded by the write transaction currently running on a
/// connection. Turned into a changeset at commit, discarded at rollback.
#[derive(Default)]
pub(crate) struct PendingChanges {
    pub(crate) object_changes: HashMap<String, Arc<[u8]>>,
    pub(crate) metadata_changes: HashMap<String, Option<Arc<[u8]>>>,
    pub(crate) removed_keys: HashSet<String>,
    pub(crate) all_keys_removed: bool,
    pub(crate) extensions_changed: Option<Arc<ExtensionRegistry>>,
}

impl PendingChanges {
    pub(crate) fn record_set(&mut self, key: &str, data: Arc<[u8]>, metadata: Option<Arc<[u8]>>) {
        self.object_changes.insert(key.to_string(), data);
        self.metadata_changes.insert(key.to_string(), metadata);
        self.removed_keys.remove(key);
    }

    pub(crate) fn record_set_metadata(&mut self, key: &str, metadata: Option<Arc<[u8]>>) {
        self.metadata_changes.insert(key.to_string(), metadata);
    }

    /// Records a removal. Entries already in the change maps are left in
    /// place; `removed_keys` wins when both mention a key.
    pub(crate) fn record_remove(&mut self, key: &str) {
        self.removed_keys.insert(key.to_string());
    }

    pub(crate) fn record_remove_all(&mut self) {
        self.object_changes.clear();
        self.metadata_changes.clear();
        self.removed_keys.clear();
        self.all_keys_removed = true;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.object_changes.is_empty()
            && self.metadata_changes.is_empty()
            && self.removed_keys.is_empty()
            && !self.all_keys_removed
    }

    pub(crate) fn clear(&mut self) {
        self.object_changes.clear();
        self.metadata_changes.clear();
        self.removed_keys.clear();
        self.all_keys_removed = false;
        self.extensions_changed = None;
    }

    /// Builds the two changeset forms for a commit at `snapshot`.
    pub(crate) fn build_changeset(
        &self,
        snapshot: u64,
        connection_name: &str,
        ext_internal: HashMap<String, ExtensionPayload>,
        ext_external: HashMap<String, ExtensionPayload>,
    ) -> (InternalChangeset, CommitNotification) {
        let internal = InternalChangeset {
            snapshot,
            object_changes: self.object_changes.clone(),
            metadata_changes: self.metadata_changes.clone(),
            removed_keys: self.removed_keys.clone(),
            all_keys_removed: self.all_keys_removed,
            extensions: ext_internal,
            extensions_changed: self.extensions_changed.as_ref().map(registry_payload),
        };
        let external = CommitNotification {
            snapshot,
            connection_name: connection_name.to_string(),
            data_changed: self.object_changes.keys().cloned().collect(),
            metadata_changed: self.metadata_changes.keys().cloned().collect(),
            removed_keys: self.removed_keys.clone(),
            all_keys_removed: self.all_keys_removed,
            extensions: ext_external,
        };
        (internal, external)
    }
}

// ============================================================================
// Core state
// ============================================================================

/// The non-extension half of a connection's worker state.
///
/// Split from the extension slots so hook contexts can borrow the core
/// mutably while a slot's transaction object is borrowed alongside it.
pub(crate) struct CoreState {
    pub(crate) db: Arc<DatabaseInner>,
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) store: Store,
    /// Snapshot this connection's caches are valid for.
    pub(crate) snapshot: u64,
    pub(crate) object_cache: BoundedCache<String, Arc<[u8]>>,
    /// Caches `None` for rows that exist without metadata. Missing rows are
    /// never cached.
    pub(crate) metadata_cache: BoundedCache<String, Option<Arc<[u8]>>>,
    pub(crate) pending: PendingChanges,
    pub(crate) long_lived: bool,
    /// Changesets received while a long-lived read pins an old snapshot.
    pub(crate) accumulated: Vec<(Arc<InternalChangeset>, Arc<CommitNotification>)>,
}

impl CoreState {
    /// Reads a row's data through the object cache.
    pub(crate) fn get_data(&mut self, key: &str) -> Result<Option<Arc<[u8]>>> {
        if let Some(data) = self.object_cache.get(key) {
            return Ok(Some(data));
        }
        match self.store.row_data(key)? {
            Some(data) => {
                let data: Arc<[u8]> = Arc::from(data);
                self.object_cache.insert(key.to_string(), Arc::clone(&data));
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Reads a row's metadata through the metadata cache. The outer `None`
    /// means the row does not exist.
    pub(crate) fn get_metadata(&mut self, key: &str) -> Result<Option<Option<Arc<[u8]>>>> {
        if let Some(metadata) = self.metadata_cache.get(key) {
            return Ok(Some(metadata));
        }
        match self.store.row_metadata(key)? {
            Some(metadata) => {
                let metadata: Option<Arc<[u8]>> = metadata.map(Arc::from);
                self.metadata_cache.insert(key.to_string(), metadata.clone());
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    /// Reads a full row, filling whichever cache halves were cold.
    pub(crate) fn get_row(&mut self, key: &str) -> Result<Option<(Arc<[u8]>, Option<Arc<[u8]>>)>> {
        match (self.object_cache.get(key), self.metadata_cache.get(key)) {
            (Some(data), Some(metadata)) => Ok(Some((data, metadata))),
            (Some(data), None) => match self.get_metadata(key)? {
                Some(metadata) => Ok(Some((data, metadata))),
                None => Ok(None),
            },
            (None, Some(metadata)) => match self.get_data(key)? {
                Some(data) => Ok(Some((data, metadata))),
                None => Ok(None),
            },
            (None, None) => match self.store.row(key)? {
                Some((data, metadata)) => {
                    let data: Arc<[u8]> = Arc::from(data);
                    let metadata: Option<Arc<[u8]>> = metadata.map(Arc::from);
                    self.object_cache.insert(key.to_string(), Arc::clone(&data));
                    self.metadata_cache.insert(key.to_string(), metadata.clone());
                    Ok(Some((data, metadata)))
                }
                None => Ok(None),
            },
        }
    }
}

// ============================================================================
// Extension slots
// ============================================================================

pub(crate) enum SlotState {
    /// Connection-level state, between transactions.
    Idle(Box<dyn ExtensionConnection>),
    /// Transaction-level state, inside one.
    Active(Box<dyn ExtensionTransaction>),
    /// Transient marker while a state box is being moved.
    Vacant,
}

pub(crate) struct ExtSlot {
    pub(crate) name: String,
    pub(crate) ext: Arc<dyn Extension>,
    pub(crate) state: SlotState,
}

#[derive(Default)]
pub(crate) struct ExtensionSlots {
    pub(crate) slots: Vec<ExtSlot>,
}

// ============================================================================
// Worker state
// ============================================================================

/// Everything the connection's worker thread owns.
pub(crate) struct ConnectionInner {
    pub(crate) core: CoreState,
    pub(crate) exts: ExtensionSlots,
}

impl ConnectionInner {
    pub(crate) fn new(core: CoreState, registry: &ExtensionRegistry) -> Self {
        let slots = registry
            .iter()
            .map(|reg| ExtSlot {
                name: reg.name.clone(),
                ext: Arc::clone(&reg.ext),
                state: SlotState::Idle(reg.ext.new_connection_state(&reg.name)),
            })
            .collect();
        Self {
            core,
            exts: ExtensionSlots { slots },
        }
    }

    /// Begins transaction-level state for every idle extension slot.
    /// Idempotent within a transaction; called lazily on the first mutation
    /// or extension access.
    pub(crate) fn ensure_extensions_begun(&mut self, read_write: bool) -> Result<()> {
        let ConnectionInner { core, exts } = self;
        for slot in &mut exts.slots {
            let ExtSlot { name, state, .. } = slot;
            if !matches!(state, SlotState::Idle(_)) {
                continue;
            }
            let conn_state = match std::mem::replace(state, SlotState::Vacant) {
                SlotState::Idle(c) => c,
                _ => unreachable!(),
            };
            let mut txn = conn_state.begin(read_write);
            let prepared = {
                let mut ctx = ExtContext {
                    core: &mut *core,
                    name,
                    read_write,
                };
                txn.prepare_if_needed(&mut ctx)
            };
            // Restore the slot before propagating so a failed prepare still
            // winds down through the normal commit/rollback path.
            *state = SlotState::Active(txn);
            prepared?;
        }
        Ok(())
    }

    /// Ends every active extension transaction, folding state back into the
    /// connection level.
    pub(crate) fn finish_extension_transactions(&mut self, committed: bool) {
        for slot in &mut self.exts.slots {
            if !matches!(slot.state, SlotState::Active(_)) {
                continue;
            }
            let txn = match std::mem::replace(&mut slot.state, SlotState::Vacant) {
                SlotState::Active(t) => t,
                _ => unreachable!(),
            };
            let conn_state = if committed { txn.commit() } else { txn.rollback() };
            slot.state = SlotState::Idle(conn_state);
        }
    }

    /// Rebuilds the slot list to mirror `registry`, keeping existing state
    /// for extensions that survive and dropping state for ones that left.
    pub(crate) fn sync_slots(&mut self, registry: &ExtensionRegistry) {
        let mut old = std::mem::take(&mut self.exts.slots);
        let mut slots = Vec::with_capacity(registry.len());
        for reg in registry {
            match old.iter().position(|s| s.name == reg.name) {
                Some(pos) => slots.push(old.swap_remove(pos)),
                None => slots.push(ExtSlot {
                    name: reg.name.clone(),
                    ext: Arc::clone(&reg.ext),
                    state: SlotState::Idle(reg.ext.new_connection_state(&reg.name)),
                }),
            }
        }
        self.exts.slots = slots;
    }

    /// Folds one sibling changeset into the caches and extension state, and
    /// advances the connection snapshot to it.
    pub(crate) fn process_changeset(&mut self, changeset: &InternalChangeset) {
        if let Some(payload) = &changeset.extensions_changed {
            if let Some(registry) = registry_from_payload(payload) {
                self.sync_slots(&registry);
            }
        }

        let ConnectionInner { core, exts } = self;

        if changeset.all_keys_removed {
            core.object_cache.clear();
            core.metadata_cache.clear();
        } else if changeset.removed_keys.is_empty() {
            for (key, data) in &changeset.object_changes {
                core.object_cache.update_if_present(key.as_str(), Arc::clone(data));
            }
            for (key, metadata) in &changeset.metadata_changes {
                core.metadata_cache.update_if_present(key.as_str(), metadata.clone());
            }
        } else {
            // A key can sit in a change map and in removed_keys when it was
            // set and later removed in the same transaction. The removal is
            // the final word.
            for (key, data) in &changeset.object_changes {
                if changeset.removed_keys.contains(key) {
                    continue;
                }
                core.object_cache.update_if_present(key.as_str(), Arc::clone(data));
            }
            for (key, metadata) in &changeset.metadata_changes {
                if changeset.removed_keys.contains(key) {
                    continue;
                }
                core.metadata_cache.update_if_present(key.as_str(), metadata.clone());
            }
            for key in &changeset.removed_keys {
                core.object_cache.remove(key.as_str());
                core.metadata_cache.remove(key.as_str());
            }
        }

        for slot in &mut exts.slots {
            if let Some(payload) = changeset.extensions.get(&slot.name) {
                match &mut slot.state {
                    SlotState::Idle(conn_state) => conn_state.apply_changeset(payload),
                    _ => panic!(
                        "changeset for extension '{}' arrived while its transaction is active",
                        slot.name
                    ),
                }
            }
        }

        core.snapshot = changeset.snapshot;
    }

    /// Applies every committed or pending changeset in `(snapshot, target]`
    /// and returns their notifications in order.
    ///
    /// Panics if the log no longer covers the range; the registry entry for
    /// this connection is what pins the log, so a gap is a bookkeeping bug.
    pub(crate) fn catch_up_to(&mut self, target: u64) -> Vec<Arc<CommitNotification>> {
        if target == self.core.snapshot {
            return Vec::new();
        }
        assert!(
            target > self.core.snapshot,
            "connection at snapshot {} asked to catch up to older snapshot {}",
            self.core.snapshot,
            target
        );
        let changesets = self.core.db.changesets_since(self.core.snapshot, target);
        let mut notifications = Vec::with_capacity(changesets.len());
        for (internal, external) in changesets {
            self.process_changeset(&internal);
            notifications.push(external);
        }
        let snapshot = self.core.snapshot;
        self.core.db.update_connection_snapshot(self.core.id, snapshot);
        notifications
    }

    /// Queued on this connection's worker after a sibling commits.
    pub(crate) fn note_sibling_commit(
        &mut self,
        internal: Arc<InternalChangeset>,
        external: Arc<CommitNotification>,
    ) {
        if self.core.long_lived {
            let newest = self
                .core
                .accumulated
                .last()
                .map(|(i, _)| i.snapshot)
                .unwrap_or(self.core.snapshot);
            if internal.snapshot > newest {
                self.core.accumulated.push((internal, external));
            }
            return;
        }
        if internal.snapshot <= self.core.snapshot {
            return;
        }
        // Re-fetch from the log rather than applying the delivered changeset
        // directly, in case this connection is more than one commit behind.
        let _ = self.catch_up_to(internal.snapshot);
    }

    /// Starts a long-lived read, or jumps one forward to the newest commit.
    /// Returns the notifications for every commit the jump passed over.
    pub(crate) fn begin_long_lived(&mut self) -> Result<Vec<Arc<CommitNotification>>> {
        if !self.core.long_lived {
            let notifications = self.begin_read_txn()?;
            self.core.long_lived = true;
            debug!(connection = %self.core.name, snapshot = self.core.snapshot, "pinned long-lived read");
            return Ok(notifications);
        }
        if self.core.accumulated.is_empty() {
            // Nothing committed since the pin; keep the current transaction.
            return Ok(Vec::new());
        }
        if let Err(e) = self.core.store.commit() {
            error!(connection = %self.core.name, "failed to end pinned read transaction: {}", e);
        }
        let accumulated = std::mem::take(&mut self.core.accumulated);
        let mut notifications = Vec::with_capacity(accumulated.len());
        for (internal, external) in accumulated {
            self.process_changeset(&internal);
            notifications.push(external);
        }
        let snapshot = self.core.snapshot;
        self.core.db.update_connection_snapshot(self.core.id, snapshot);
        // Stragglers committed after the accumulated batch are picked up by
        // the re-begin's own catch-up.
        match self.begin_read_txn() {
            Ok(more) => notifications.extend(more),
            Err(e) => {
                // No pinned transaction anymore; drop out of long-lived mode
                // rather than pretend reads are still on a fixed snapshot.
                self.core.long_lived = false;
                return Err(e);
            }
        }
        debug!(
            connection = %self.core.name,
            snapshot = self.core.snapshot,
            commits = notifications.len(),
            "moved long-lived read forward"
        );
        Ok(notifications)
    }

    /// Ends a long-lived read and catches up to the newest commit.
    pub(crate) fn end_long_lived(&mut self) -> Vec<Arc<CommitNotification>> {
        if !self.core.long_lived {
            return Vec::new();
        }
        self.core.long_lived = false;
        if let Err(e) = self.core.store.commit() {
            error!(connection = %self.core.name, "failed to end pinned read transaction: {}", e);
        }
        let accumulated = std::mem::take(&mut self.core.accumulated);
        let mut notifications = Vec::with_capacity(accumulated.len());
        for (internal, external) in accumulated {
            self.process_changeset(&internal);
            notifications.push(external);
        }
        let snapshot = self.core.snapshot;
        self.core.db.update_connection_snapshot(self.core.id, snapshot);
        notifications
    }

    /// Releases memory at the requested level. Runs between transactions, so
    /// every extension slot is idle.
    pub(crate) fn flush(&mut self, level: FlushLevel) {
        if level >= FlushLevel::Moderate {
            self.core.object_cache.clear();
            self.core.metadata_cache.clear();
            self.core.store.flush_statements();
        }
        for slot in &mut self.exts.slots {
            if let SlotState::Idle(conn_state) = &mut slot.state {
                conn_state.flush(level);
            }
        }
    }

    /// Final job before the worker drains: unpin any long-lived read so the
    /// sqlite handle closes without an open transaction.
    pub(crate) fn shutdown_cleanup(&mut self) {
        if self.core.long_lived {
            let _ = self.end_long_lived();
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// A handle onto one connection.
///
/// Connections are cheap enough to keep per subsystem but not per operation;
/// each owns a sqlite handle, caches and a worker thread. All methods may be
/// called from any thread. Dropping the handle drains outstanding work and
/// joins the worker.
pub struct Connection {
    // Declared first so the worker joins before the registry entry matters.
    pub(crate) queue: SerialQueue<ConnectionInner>,
    pub(crate) db: Arc<DatabaseInner>,
    pub(crate) id: Uuid,
    pub(crate) name: String,
}

impl Connection {
    /// The connection's name, as given in its options or generated.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database this connection belongs to.
    pub fn database(&self) -> Database {
        Database::from_inner(Arc::clone(&self.db))
    }

    /// The snapshot this connection has caught up to.
    pub fn snapshot(&self) -> u64 {
        self.queue.run_sync(|inner| inner.core.snapshot)
    }

    /// Runs a read transaction on the worker and blocks for the result.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadTransaction<'_>) -> Result<T> + Send + 'static,
    {
        self.queue.run_sync(move |inner| inner.execute_read(f))
    }

    /// Runs a read-write transaction on the worker and blocks for the result.
    ///
    /// Write transactions across all connections are serialized; this blocks
    /// while another connection's write is in flight.
    pub fn read_write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T> + Send + 'static,
    {
        self.queue.run_sync(move |inner| inner.execute_write(f))
    }

    /// Queues a read transaction; `completion` runs on the worker thread
    /// with the closure's result.
    pub fn read_async<T, F, C>(&self, f: F, completion: C)
    where
        T: Send + 'static,
        F: FnOnce(&mut ReadTransaction<'_>) -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        self.queue.push(Box::new(move |inner| {
            let result = inner.execute_read(f);
            completion(result);
        }));
    }

    /// Queues a read-write transaction; `completion` runs on the worker
    /// thread with the closure's result.
    pub fn read_write_async<T, F, C>(&self, f: F, completion: C)
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        self.queue.push(Box::new(move |inner| {
            let result = inner.execute_write(f);
            completion(result);
        }));
    }

    /// Pins this connection to its current snapshot. Later reads see that
    /// snapshot until the next call moves the pin forward.
    ///
    /// The first call returns an empty list. Subsequent calls move the pin
    /// to the newest commit and return the notifications for every commit
    /// passed over, in order.
    pub fn begin_long_lived_read(&self) -> Result<Vec<Arc<CommitNotification>>> {
        self.queue.run_sync(|inner| inner.begin_long_lived())
    }

    /// Ends a long-lived read, catching up to the newest commit. Returns the
    /// notifications for commits that happened while pinned.
    pub fn end_long_lived_read(&self) -> Vec<Arc<CommitNotification>> {
        self.queue.run_sync(|inner| inner.end_long_lived())
    }

    /// True while a long-lived read pins this connection.
    pub fn is_in_long_lived_read(&self) -> bool {
        self.queue.run_sync(|inner| inner.core.long_lived)
    }

    /// Queues a memory flush behind outstanding work.
    pub fn flush_memory(&self, level: FlushLevel) {
        self.queue.push(Box::new(move |inner| inner.flush(level)));
    }

    /// Cache hit/miss counters, for diagnostics.
    pub fn cache_stats(&self) -> CacheStats {
        self.queue.run_sync(|inner| CacheStats {
            object_hits: inner.core.object_cache.hits(),
            object_misses: inner.core.object_cache.misses(),
            metadata_hits: inner.core.metadata_cache.hits(),
            metadata_misses: inner.core.metadata_cache.misses(),
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let handle = self.queue.handle();
        let _ = handle.try_push(Box::new(|inner: &mut ConnectionInner| {
            inner.shutdown_cleanup();
        }));
        self.db.remove_connection(self.id);
        // The queue field drop drains remaining jobs and joins the worker.
    }
}

/// Snapshot of a connection's cache counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Row data cache hits.
    pub object_hits: u64,
    /// Row data cache misses.
    pub object_misses: u64,
    /// Metadata cache hits.
    pub metadata_hits: u64,
    /// Metadata cache misses.
    pub metadata_misses: u64,
}
