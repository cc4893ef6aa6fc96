//! Transactions.
//!
//! [`ReadTransaction`] exposes the read surface; [`WriteTransaction`] derefs
//! to it and adds mutations, so the type states which operations a closure
//! may perform. Both are handed to closures by `Connection::read` and
//! `Connection::read_write` and never constructed directly.
//!
//! The commit pipeline produces the snapshot bump: harvest extension
//! changesets, stamp the new snapshot into the bookkeeping table inside the
//! transaction, publish the changeset as pending, commit sqlite, then mark
//! the changeset committed and fan it out.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use vantage_core::{CommitNotification, Error, Result, SettingValue};

use crate::connection::{ConnectionInner, ExtSlot, SlotState};
use crate::extension::{
    ExtContext, Extension, ExtensionTransaction, RegisteredExtension, SETTING_CLASS,
    SETTING_TABLES,
};

// ============================================================================
// Read transactions
// ============================================================================

/// A transaction that can read rows and query extensions.
pub struct ReadTransaction<'a> {
    pub(crate) inner: &'a mut ConnectionInner,
    pub(crate) read_write: bool,
}

impl<'a> ReadTransaction<'a> {
    /// The snapshot this transaction sees.
    pub fn snapshot(&self) -> u64 {
        self.inner.core.snapshot
    }

    /// Name of the connection running this transaction.
    pub fn connection_name(&self) -> &str {
        &self.inner.core.name
    }

    /// Returns a row's data.
    pub fn get(&mut self, key: &str) -> Result<Option<Arc<[u8]>>> {
        self.inner.core.get_data(key)
    }

    /// Returns a row's metadata. `None` when the row is missing or carries
    /// no metadata; use [`get_row`](Self::get_row) to tell those apart.
    pub fn get_metadata(&mut self, key: &str) -> Result<Option<Arc<[u8]>>> {
        Ok(self.inner.core.get_metadata(key)?.flatten())
    }

    /// Returns a row's data and metadata together.
    pub fn get_row(&mut self, key: &str) -> Result<Option<(Arc<[u8]>, Option<Arc<[u8]>>)>> {
        self.inner.core.get_row(key)
    }

    /// True if a row exists under `key`.
    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        if self.inner.core.object_cache.contains(key) || self.inner.core.metadata_cache.contains(key)
        {
            return Ok(true);
        }
        Ok(self.inner.core.store.row_rowid(key)?.is_some())
    }

    /// Number of rows.
    pub fn len(&mut self) -> Result<u64> {
        Ok(self.inner.core.store.row_count()?)
    }

    /// True when the store holds no rows.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every key, unordered.
    pub fn all_keys(&mut self) -> Result<Vec<String>> {
        Ok(self.inner.core.store.all_keys()?)
    }

    /// Visits every key until `f` returns false.
    pub fn enumerate_keys(&mut self, mut f: impl FnMut(&str) -> bool) -> Result<()> {
        Ok(self.inner.core.store.enumerate_keys(|_, key| f(key))?)
    }

    /// Visits every key and its data until `f` returns false.
    pub fn enumerate_keys_and_data(
        &mut self,
        mut f: impl FnMut(&str, &[u8]) -> bool,
    ) -> Result<()> {
        Ok(self
            .inner
            .core
            .store
            .enumerate_keys_and_data(|_, key, data| f(key, data))?)
    }

    /// Visits every key and its metadata until `f` returns false.
    pub fn enumerate_keys_and_metadata(
        &mut self,
        mut f: impl FnMut(&str, Option<&[u8]>) -> bool,
    ) -> Result<()> {
        Ok(self
            .inner
            .core
            .store
            .enumerate_keys_and_metadata(|_, key, metadata| f(key, metadata))?)
    }

    /// Visits every full row until `f` returns false.
    pub fn enumerate_rows(
        &mut self,
        mut f: impl FnMut(&str, &[u8], Option<&[u8]>) -> bool,
    ) -> Result<()> {
        Ok(self
            .inner
            .core
            .store
            .enumerate_rows(|_, key, data, metadata| f(key, data, metadata))?)
    }

    /// Runs `f` against the named extension's transaction state, beginning
    /// extension transactions if this is the first access. Returns `None`
    /// when no extension is registered under `name`.
    ///
    /// Typed query surfaces are built on top of this plus
    /// [`ExtensionTransaction::as_any_mut`](crate::ExtensionTransaction::as_any_mut).
    pub fn with_extension<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut dyn ExtensionTransaction, &mut ExtContext<'_>) -> R,
    ) -> Result<Option<R>> {
        let read_write = self.read_write;
        self.inner.ensure_extensions_begun(read_write)?;
        let ConnectionInner { core, exts } = &mut *self.inner;
        for slot in &mut exts.slots {
            if slot.name != name {
                continue;
            }
            let ExtSlot { name, state, .. } = slot;
            if let SlotState::Active(txn) = state {
                let mut ctx = ExtContext {
                    core: &mut *core,
                    name,
                    read_write,
                };
                return Ok(Some(f(txn.as_mut(), &mut ctx)));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Write transactions
// ============================================================================

/// A transaction that can also mutate rows.
pub struct WriteTransaction<'a> {
    pub(crate) read: ReadTransaction<'a>,
    pub(crate) rollback_requested: bool,
}

impl<'a> Deref for WriteTransaction<'a> {
    type Target = ReadTransaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

impl<'a> DerefMut for WriteTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.read
    }
}

impl<'a> WriteTransaction<'a> {
    /// Sets a row's data and metadata, inserting or replacing.
    pub fn set(&mut self, key: &str, data: &[u8], metadata: Option<&[u8]>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::config("row keys must not be empty"));
        }
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        let (rowid, inserted) = match inner.core.store.row_rowid(key)? {
            Some(rowid) => {
                inner.core.store.update_row(rowid, data, metadata)?;
                (rowid, false)
            }
            None => (inner.core.store.insert_row(key, data, metadata)?, true),
        };
        let data_arc: Arc<[u8]> = Arc::from(data.to_vec());
        let metadata_arc: Option<Arc<[u8]>> = metadata.map(|m| Arc::from(m.to_vec()));
        inner
            .core
            .object_cache
            .insert(key.to_string(), Arc::clone(&data_arc));
        inner
            .core
            .metadata_cache
            .insert(key.to_string(), metadata_arc.clone());
        inner.core.pending.record_set(key, data_arc, metadata_arc);
        if inserted {
            dispatch_hook(inner, |ext, ctx| ext.on_insert(ctx, key, rowid, data, metadata))
        } else {
            dispatch_hook(inner, |ext, ctx| ext.on_update(ctx, key, rowid, data, metadata))
        }
    }

    /// Replaces a row's metadata, leaving its data untouched. A missing row
    /// is a logged no-op; metadata cannot exist without a row.
    pub fn set_metadata(&mut self, key: &str, metadata: Option<&[u8]>) -> Result<()> {
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        let rowid = match inner.core.store.row_rowid(key)? {
            Some(rowid) => rowid,
            None => {
                warn!(key, "set_metadata ignored, no row under this key");
                return Ok(());
            }
        };
        inner.core.store.update_row_metadata(rowid, metadata)?;
        let metadata_arc: Option<Arc<[u8]>> = metadata.map(|m| Arc::from(m.to_vec()));
        inner
            .core
            .metadata_cache
            .insert(key.to_string(), metadata_arc.clone());
        inner.core.pending.record_set_metadata(key, metadata_arc);
        dispatch_hook(inner, |ext, ctx| {
            ext.on_update_metadata_only(ctx, key, rowid, metadata)
        })
    }

    /// Removes a row. Removing a missing key is a no-op.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        let rowid = match inner.core.store.row_rowid(key)? {
            Some(rowid) => rowid,
            None => return Ok(()),
        };
        inner.core.store.delete_row(rowid)?;
        inner.core.object_cache.remove(key);
        inner.core.metadata_cache.remove(key);
        inner.core.pending.record_remove(key);
        dispatch_hook(inner, |ext, ctx| ext.on_remove(ctx, key, rowid))
    }

    /// Removes several rows, delivering one batched hook to extensions.
    pub fn remove_many<'k, I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = &'k str>,
    {
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        let mut found: Vec<(String, i64)> = Vec::new();
        for key in keys {
            if let Some(rowid) = inner.core.store.row_rowid(key)? {
                found.push((key.to_string(), rowid));
            }
        }
        if found.is_empty() {
            return Ok(());
        }
        for (key, rowid) in &found {
            inner.core.store.delete_row(*rowid)?;
            inner.core.object_cache.remove(key.as_str());
            inner.core.metadata_cache.remove(key.as_str());
            inner.core.pending.record_remove(key);
        }
        dispatch_hook(inner, |ext, ctx| ext.on_remove_many(ctx, &found))
    }

    /// Removes every row.
    pub fn remove_all(&mut self) -> Result<()> {
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        inner.core.store.delete_all_rows()?;
        inner.core.object_cache.clear();
        inner.core.metadata_cache.clear();
        inner.core.pending.record_remove_all();
        dispatch_hook(inner, |ext, ctx| ext.on_remove_all(ctx))
    }

    /// Marks a row as changed without altering it. The commit notification
    /// lists the key and extensions re-evaluate it; useful after mutating
    /// state a sort function reads from outside the row.
    pub fn touch(&mut self, key: &str) -> Result<()> {
        self.read.inner.ensure_extensions_begun(true)?;
        let inner = &mut *self.read.inner;
        let rowid = match inner.core.store.row_rowid(key)? {
            Some(rowid) => rowid,
            None => return Ok(()),
        };
        let (data, metadata) = match inner.core.get_row(key)? {
            Some(row) => row,
            None => return Ok(()),
        };
        inner.core.pending.record_set(key, data, metadata);
        dispatch_hook(inner, |ext, ctx| ext.on_touch(ctx, key, rowid))
    }

    /// Discards every change made in this transaction when the closure
    /// returns. The closure's return value still reaches the caller.
    pub fn rollback(&mut self) {
        self.rollback_requested = true;
    }

    pub(crate) fn register_extension_impl(
        &mut self,
        name: &str,
        ext: Arc<dyn Extension>,
    ) -> Result<()> {
        let inner = &mut *self.read.inner;
        let registry = inner.core.db.current_registry();
        if registry.iter().any(|r| r.name == name) {
            return Err(Error::config(format!(
                "extension '{}' is already registered",
                name
            )));
        }
        if let Some(SettingValue::Text(previous)) = inner.core.store.ext_get(name, SETTING_CLASS)? {
            if previous != ext.class_name() {
                return Err(Error::config(format!(
                    "extension name '{}' previously belonged to class '{}'; unregister it first",
                    name, previous
                )));
            }
        }
        inner.ensure_extensions_begun(true)?;

        // The new extension participates in this very transaction so its
        // tables are created and populated atomically with the registration.
        let conn_state = ext.new_connection_state(name);
        let mut ext_txn = conn_state.begin(true);
        {
            let mut ctx = ExtContext {
                core: &mut inner.core,
                name,
                read_write: true,
            };
            ext_txn.create_if_needed(&mut ctx)?;
            ext_txn.prepare_if_needed(&mut ctx)?;
        }
        inner.core.store.ext_set(
            name,
            SETTING_CLASS,
            &SettingValue::Text(ext.class_name().to_string()),
        )?;
        inner.core.store.ext_set(
            name,
            SETTING_TABLES,
            &SettingValue::Text(ext.table_names(name).join(",")),
        )?;
        inner.exts.slots.push(ExtSlot {
            name: name.to_string(),
            ext: Arc::clone(&ext),
            state: SlotState::Active(ext_txn),
        });
        let mut new_registry = registry.as_ref().clone();
        new_registry.push(RegisteredExtension {
            name: name.to_string(),
            ext,
        });
        inner.core.pending.extensions_changed = Some(Arc::new(new_registry));
        info!(extension = name, "registered extension");
        Ok(())
    }

    pub(crate) fn unregister_extension_impl(&mut self, name: &str) -> Result<()> {
        let inner = &mut *self.read.inner;
        let registry = inner.core.db.current_registry();
        let registered = registry.iter().any(|r| r.name == name);
        let persisted = inner.core.store.ext_get(name, SETTING_CLASS)?.is_some();
        if !registered && !persisted {
            return Err(Error::config(format!(
                "no extension registered or persisted under '{}'",
                name
            )));
        }
        // Drop this connection's slot first so the extension stops
        // participating in the transaction that removes it.
        inner.exts.slots.retain(|slot| slot.name != name);
        let tables = match inner.core.store.ext_get(name, SETTING_TABLES)? {
            Some(SettingValue::Text(joined)) if !joined.is_empty() => joined
                .split(',')
                .map(|t| t.to_string())
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        for table in &tables {
            inner
                .core
                .store
                .execute_ddl(&format!("DROP TABLE IF EXISTS \"{}\"", table))?;
        }
        inner.core.store.ext_delete_all(name)?;
        let new_registry: Vec<RegisteredExtension> = registry
            .iter()
            .filter(|r| r.name != name)
            .cloned()
            .collect();
        inner.core.pending.extensions_changed = Some(Arc::new(new_registry));
        info!(extension = name, tables = tables.len(), "unregistered extension");
        Ok(())
    }
}

/// Delivers one hook to every active extension, in registration order.
fn dispatch_hook(
    inner: &mut ConnectionInner,
    f: impl Fn(&mut dyn ExtensionTransaction, &mut ExtContext<'_>) -> Result<()>,
) -> Result<()> {
    let ConnectionInner { core, exts } = inner;
    for slot in &mut exts.slots {
        let ExtSlot { name, state, .. } = slot;
        if let SlotState::Active(txn) = state {
            let mut ctx = ExtContext {
                core: &mut *core,
                name,
                read_write: true,
            };
            f(txn.as_mut(), &mut ctx)?;
        }
    }
    Ok(())
}

// ============================================================================
// Transaction execution
// ============================================================================

impl ConnectionInner {
    /// Begins a sqlite read transaction and reconciles the connection with
    /// the snapshot it exposes.
    ///
    /// The snapshot read also forces sqlite to materialize the deferred
    /// transaction, so the snapshot cannot move under us afterwards. If the
    /// store is ahead of the connection, the missing changesets are pulled
    /// from the log, including ones whose commits are still being announced.
    pub(crate) fn begin_read_txn(&mut self) -> Result<Vec<Arc<CommitNotification>>> {
        self.core.store.begin_read()?;
        let sql_snapshot = self.core.store.read_snapshot()?;
        if sql_snapshot < self.core.snapshot {
            panic!(
                "store shows snapshot {} but connection already applied {}",
                sql_snapshot, self.core.snapshot
            );
        }
        Ok(self.catch_up_to(sql_snapshot))
    }

    pub(crate) fn execute_read<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ReadTransaction<'_>) -> Result<T>,
    {
        let long_lived = self.core.long_lived;
        if !long_lived {
            self.begin_read_txn()?;
        }
        let mut txn = ReadTransaction {
            inner: &mut *self,
            read_write: false,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
        self.finish_extension_transactions(outcome.is_ok());
        if !long_lived {
            if let Err(e) = self.core.store.commit() {
                error!(connection = %self.core.name, "failed to end read transaction: {}", e);
            }
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }

    pub(crate) fn execute_write<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        if self.core.long_lived {
            warn!(
                connection = %self.core.name,
                "ending long-lived read implicitly to run a write transaction"
            );
            let _ = self.end_long_lived();
        }
        let db = Arc::clone(&self.core.db);
        // Held through commit, fan-out and observer callbacks so writes and
        // their notifications stay in one global order.
        let _writer = db.write_lock.lock();
        self.core.store.begin_write()?;
        let sql_snapshot = self.core.store.read_snapshot()?;
        if sql_snapshot < self.core.snapshot {
            panic!(
                "store shows snapshot {} but connection already applied {}",
                sql_snapshot, self.core.snapshot
            );
        }
        let _ = self.catch_up_to(sql_snapshot);
        let mut txn = WriteTransaction {
            read: ReadTransaction {
                inner: &mut *self,
                read_write: true,
            },
            rollback_requested: false,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
        let rollback_requested = txn.rollback_requested;
        match outcome {
            Ok(Ok(value)) => {
                if rollback_requested {
                    self.rollback_write();
                    Ok(value)
                } else {
                    self.commit_write()?;
                    Ok(value)
                }
            }
            Ok(Err(e)) => {
                self.rollback_write();
                Err(e)
            }
            Err(panic) => {
                self.rollback_write();
                resume_unwind(panic)
            }
        }
    }

    fn commit_write(&mut self) -> Result<()> {
        match self.try_commit_write() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback_write();
                Err(e)
            }
        }
    }

    fn try_commit_write(&mut self) -> Result<()> {
        let ConnectionInner { core, exts } = self;

        // Harvest extension changesets. pre_commit is each extension's last
        // chance to write to its tables inside the transaction.
        let mut ext_internal = HashMap::new();
        let mut ext_external = HashMap::new();
        let mut ext_dirty = false;
        for slot in &mut exts.slots {
            let ExtSlot { name, state, .. } = slot;
            if let SlotState::Active(txn) = state {
                {
                    let mut ctx = ExtContext {
                        core: &mut *core,
                        name,
                        read_write: true,
                    };
                    txn.pre_commit(&mut ctx)?;
                }
                let changeset = txn.changeset();
                ext_dirty |= changeset.has_disk_changes;
                if let Some(payload) = changeset.internal {
                    ext_internal.insert(name.clone(), payload);
                }
                if let Some(payload) = changeset.external {
                    ext_external.insert(name.clone(), payload);
                }
            }
        }

        let changed = !core.pending.is_empty()
            || core.pending.extensions_changed.is_some()
            || ext_dirty
            || !ext_internal.is_empty();
        if !changed {
            // Nothing happened; commit without bumping the snapshot or
            // waking anyone up.
            core.store.commit()?;
            self.finish_extension_transactions(true);
            self.core.pending.clear();
            return Ok(());
        }

        let new_snapshot = core.snapshot + 1;
        core.store.write_snapshot(new_snapshot)?;
        let (internal, external) =
            core.pending
                .build_changeset(new_snapshot, &core.name, ext_internal, ext_external);
        let internal = Arc::new(internal);
        let external = Arc::new(external);

        // Published before the sqlite commit so a reader that lands on the
        // new snapshot mid-commit finds the changeset it needs in the log.
        core.db.note_pending(Arc::clone(&internal), Arc::clone(&external));
        if let Err(e) = core.store.commit() {
            core.db.withdraw_pending(new_snapshot);
            return Err(e.into());
        }
        core.snapshot = new_snapshot;
        core.db.note_committed(new_snapshot, core.id);
        debug!(connection = %core.name, snapshot = new_snapshot, "committed write transaction");
        self.finish_extension_transactions(true);
        self.core.pending.clear();
        Ok(())
    }

    pub(crate) fn rollback_write(&mut self) {
        if let Err(e) = self.core.store.rollback() {
            error!(connection = %self.core.name, "failed to roll back write transaction: {}", e);
        }
        // The caches were updated eagerly during the transaction; evict
        // everything the transaction claimed to change so later reads refill
        // from the store.
        let core = &mut self.core;
        if core.pending.all_keys_removed {
            core.object_cache.clear();
            core.metadata_cache.clear();
        } else {
            for key in core.pending.object_changes.keys() {
                core.object_cache.remove(key.as_str());
            }
            for key in core.pending.metadata_changes.keys() {
                core.metadata_cache.remove(key.as_str());
            }
            for key in &core.pending.removed_keys {
                core.object_cache.remove(key.as_str());
                core.metadata_cache.remove(key.as_str());
            }
        }
        self.finish_extension_transactions(false);
        self.core.pending.clear();
        debug!(connection = %self.core.name, "rolled back write transaction");
    }
}
