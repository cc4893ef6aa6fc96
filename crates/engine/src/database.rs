//! Database object and shared snapshot state.
//!
//! One [`Database`] stands for one sqlite file. It owns no sqlite handle of
//! its own besides the checkpoint worker's; all row traffic goes through
//! [`Connection`]s. What it does own is the shared bookkeeping: the newest
//! committed snapshot, the changeset log, the connection registry used for
//! fan-out, the extension registry and the commit observer list.
//!
//! The changeset log retains every changeset some live connection has not
//! yet applied. A connection's registry entry records the snapshot it has
//! caught up to; the log is pruned to the slowest connection after every
//! commit and registry change.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use vantage_core::{CommitNotification, Error, InternalChangeset, Result};
use vantage_store::{CheckpointMode, JournalMode, Store};

use crate::cache::BoundedCache;
use crate::connection::{Connection, ConnectionInner, CoreState, PendingChanges};
use crate::extension::{
    registry_from_payload, validate_extension_name, Extension, ExtensionHandle, ExtensionRegistry,
};
use crate::options::{ConnectionOptions, Options};
use crate::worker::{QueueHandle, SerialQueue};

/// Attempts before a busy passive checkpoint is abandoned until the next
/// commit schedules another.
const CHECKPOINT_ATTEMPTS: u32 = 5;

type CommitObserver = Arc<dyn Fn(&Arc<CommitNotification>) + Send + Sync>;

// ============================================================================
// Shared state
// ============================================================================

/// One committed (or committing) changeset held for connections that have
/// not applied it yet.
pub(crate) struct LoggedChangeset {
    pub(crate) snapshot: u64,
    /// False while the producing transaction is between writing sqlite and
    /// announcing the commit. Readers that land on the new snapshot in that
    /// window still apply the entry.
    pub(crate) committed: bool,
    pub(crate) internal: Arc<InternalChangeset>,
    pub(crate) external: Arc<CommitNotification>,
}

pub(crate) struct ConnectionEntry {
    pub(crate) id: Uuid,
    /// Snapshot this connection has applied. Pins the changeset log.
    pub(crate) snapshot: u64,
    pub(crate) handle: QueueHandle<ConnectionInner>,
}

pub(crate) struct SnapshotState {
    /// Newest committed snapshot.
    pub(crate) snapshot: u64,
    pub(crate) log: VecDeque<LoggedChangeset>,
    pub(crate) connections: Vec<ConnectionEntry>,
    pub(crate) extensions: Arc<ExtensionRegistry>,
}

impl SnapshotState {
    fn prune_log(&mut self) {
        let min_snapshot = self
            .connections
            .iter()
            .map(|c| c.snapshot)
            .min()
            .unwrap_or(self.snapshot);
        self.log
            .retain(|e| e.snapshot > min_snapshot || !e.committed);
    }
}

// ============================================================================
// Database
// ============================================================================

/// Handle to one database file. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    /// Serializes write transactions across every connection. Held through
    /// commit, fan-out and observer callbacks.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) state: Mutex<SnapshotState>,
    observers: Mutex<Vec<(u64, CommitObserver)>>,
    next_observer_token: AtomicU64,
    next_connection_seq: AtomicU64,
    checkpoint: SerialQueue<CheckpointState>,
    checkpoint_pending: Arc<AtomicBool>,
    previously_registered: Vec<String>,
}

impl Database {
    /// Opens (creating if missing) the database at `path` with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, Options::default())
    }

    /// Opens (creating if missing) the database at `path`.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Store::open(&path, &options.store)?;
        store.init_schema()?;
        let snapshot = store.read_snapshot()?;
        let previously_registered = store.ext_names()?;
        info!(
            path = %path.display(),
            snapshot,
            journal = options.store.journal_mode.pragma_value(),
            "opened database"
        );
        // The bootstrap handle moves to the checkpoint worker; everything
        // else opens its own.
        let checkpoint =
            SerialQueue::spawn("vantage-checkpoint".to_string(), CheckpointState { store });
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                options,
                write_lock: Mutex::new(()),
                state: Mutex::new(SnapshotState {
                    snapshot,
                    log: VecDeque::new(),
                    connections: Vec::new(),
                    extensions: Arc::new(Vec::new()),
                }),
                observers: Mutex::new(Vec::new()),
                next_observer_token: AtomicU64::new(1),
                next_connection_seq: AtomicU64::new(1),
                checkpoint,
                checkpoint_pending: Arc::new(AtomicBool::new(false)),
                previously_registered,
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The options this database was opened with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Newest committed snapshot.
    pub fn snapshot(&self) -> u64 {
        self.inner.state.lock().snapshot
    }

    /// Opens a connection with the database's default connection options.
    pub fn connection(&self) -> Result<Connection> {
        self.connection_with_options(self.inner.options.connection.clone())
    }

    /// Opens a connection.
    pub fn connection_with_options(&self, options: ConnectionOptions) -> Result<Connection> {
        let store = Store::open(&self.inner.path, &self.inner.options.store)?;
        let id = Uuid::new_v4();
        let name = options.name.unwrap_or_else(|| {
            format!(
                "connection-{}",
                self.inner.next_connection_seq.fetch_add(1, Ordering::Relaxed)
            )
        });

        // Everything from reading the current snapshot to publishing the
        // registry entry happens under one lock so a commit cannot slip in
        // and prune log entries this connection would still need.
        let mut state = self.inner.state.lock();
        let core = CoreState {
            db: Arc::clone(&self.inner),
            id,
            name: name.clone(),
            store,
            snapshot: state.snapshot,
            object_cache: BoundedCache::new(options.object_cache_limit),
            metadata_cache: BoundedCache::new(options.metadata_cache_limit),
            pending: PendingChanges::default(),
            long_lived: false,
            accumulated: Vec::new(),
        };
        let worker_state = ConnectionInner::new(core, &state.extensions);
        let queue = SerialQueue::spawn(format!("vantage-{}", name), worker_state);
        let snapshot = state.snapshot;
        state.connections.push(ConnectionEntry {
            id,
            snapshot,
            handle: queue.handle(),
        });
        drop(state);

        debug!(connection = %name, "opened connection");
        Ok(Connection {
            queue,
            db: Arc::clone(&self.inner),
            id,
            name,
        })
    }

    /// Registers an extension under `name` and returns a typed handle to it.
    ///
    /// Creates and populates the extension's tables in one write
    /// transaction; existing connections pick the extension up with the
    /// commit. Must not be called from inside a transaction closure.
    pub fn register_extension<E>(&self, name: &str, ext: E) -> Result<ExtensionHandle<E>>
    where
        E: Extension + 'static,
    {
        let ext: Arc<dyn Extension> = Arc::new(ext);
        self.register_extension_dyn(name, ext)?;
        Ok(ExtensionHandle::new(name.to_string()))
    }

    fn register_extension_dyn(&self, name: &str, ext: Arc<dyn Extension>) -> Result<()> {
        if !validate_extension_name(name) {
            return Err(Error::config(format!(
                "extension names must be non-empty [A-Za-z0-9_], got '{}'",
                name
            )));
        }
        if !ext.supports_store() {
            return Err(Error::config(format!(
                "extension '{}' does not support this store configuration",
                name
            )));
        }
        let conn = self.connection_with_options(ConnectionOptions {
            name: Some(format!("register-{}", name)),
            object_cache_limit: 16,
            metadata_cache_limit: 16,
        })?;
        let name = name.to_string();
        conn.read_write(move |txn| txn.register_extension_impl(&name, ext))
    }

    /// Unregisters the extension under `name`, dropping its tables and
    /// persisted settings.
    ///
    /// Also works for extensions that are not registered this run but left
    /// tables behind in an earlier one; see
    /// [`previously_registered_extensions`](Self::previously_registered_extensions).
    /// Must not be called from inside a transaction closure.
    pub fn unregister_extension(&self, name: &str) -> Result<()> {
        let conn = self.connection_with_options(ConnectionOptions {
            name: Some(format!("unregister-{}", name)),
            object_cache_limit: 16,
            metadata_cache_limit: 16,
        })?;
        let name = name.to_string();
        conn.read_write(move |txn| txn.unregister_extension_impl(&name))
    }

    /// Names of the currently registered extensions, in registration order.
    pub fn registered_extension_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.extensions.iter().map(|r| r.name.clone()).collect()
    }

    /// Names of extensions that had persisted state when the database was
    /// opened. Ones not re-registered can be cleaned up with
    /// [`unregister_extension`](Self::unregister_extension).
    pub fn previously_registered_extensions(&self) -> Vec<String> {
        self.inner.previously_registered.clone()
    }

    /// Registers a callback invoked after every changing commit, on the
    /// committing connection's worker thread.
    ///
    /// The callback runs while the global write lock is held. It must not
    /// start or wait on transactions; inspect the notification and hand
    /// anything heavier to another thread. Returns a token for
    /// [`remove_commit_observer`](Self::remove_commit_observer).
    pub fn add_commit_observer<F>(&self, f: F) -> u64
    where
        F: Fn(&Arc<CommitNotification>) + Send + Sync + 'static,
    {
        let token = self.inner.next_observer_token.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((token, Arc::new(f)));
        token
    }

    /// Removes a commit observer. Unknown tokens are ignored.
    pub fn remove_commit_observer(&self, token: u64) {
        self.inner.observers.lock().retain(|(t, _)| *t != token);
    }
}

// ============================================================================
// Engine-internal state transitions
// ============================================================================

impl DatabaseInner {
    /// Changesets in `(after, upto]`, oldest first, pending entries
    /// included. Panics when the log no longer covers the whole range.
    pub(crate) fn changesets_since(
        &self,
        after: u64,
        upto: u64,
    ) -> Vec<(Arc<InternalChangeset>, Arc<CommitNotification>)> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for entry in &state.log {
            if entry.snapshot > after && entry.snapshot <= upto {
                out.push((Arc::clone(&entry.internal), Arc::clone(&entry.external)));
            }
        }
        assert!(
            out.len() as u64 == upto.saturating_sub(after),
            "changeset log no longer covers snapshots ({}, {}]",
            after,
            upto
        );
        out
    }

    /// Publishes a changeset about to be committed, before the sqlite
    /// commit makes its snapshot visible.
    pub(crate) fn note_pending(
        &self,
        internal: Arc<InternalChangeset>,
        external: Arc<CommitNotification>,
    ) {
        let mut state = self.state.lock();
        assert_eq!(
            internal.snapshot,
            state.snapshot + 1,
            "write transactions must commit in snapshot order"
        );
        state.log.push_back(LoggedChangeset {
            snapshot: internal.snapshot,
            committed: false,
            internal,
            external,
        });
    }

    /// Withdraws a pending changeset after its sqlite commit failed.
    pub(crate) fn withdraw_pending(&self, snapshot: u64) {
        let mut state = self.state.lock();
        state.log.retain(|e| e.snapshot != snapshot);
    }

    /// Marks `snapshot` committed, fans its changeset out to sibling
    /// connections, notifies observers and schedules a checkpoint.
    ///
    /// Runs on the committing worker with the write lock held, which is what
    /// keeps fan-out pushes in commit order on every sibling queue.
    pub(crate) fn note_committed(&self, snapshot: u64, writer: Uuid) {
        let (sibling_handles, internal, external) = {
            let mut state = self.state.lock();
            let entry = state
                .log
                .iter_mut()
                .find(|e| e.snapshot == snapshot)
                .unwrap_or_else(|| {
                    panic!("snapshot {} committed but missing from the changeset log", snapshot)
                });
            entry.committed = true;
            let internal = Arc::clone(&entry.internal);
            let external = Arc::clone(&entry.external);
            state.snapshot = snapshot;
            if let Some(payload) = &internal.extensions_changed {
                if let Some(registry) = registry_from_payload(payload) {
                    state.extensions = registry;
                }
            }
            let mut handles = Vec::new();
            for conn in &mut state.connections {
                if conn.id == writer {
                    conn.snapshot = snapshot;
                } else {
                    handles.push(conn.handle.clone());
                }
            }
            state.prune_log();
            (handles, internal, external)
        };

        for handle in sibling_handles {
            let internal = Arc::clone(&internal);
            let external = Arc::clone(&external);
            let _ = handle.try_push(Box::new(move |inner: &mut ConnectionInner| {
                inner.note_sibling_commit(internal, external);
            }));
        }

        let observers: Vec<CommitObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for observer in observers {
            observer(&external);
        }

        self.schedule_checkpoint();
    }

    /// Records that a connection caught up to `snapshot`.
    pub(crate) fn update_connection_snapshot(&self, id: Uuid, snapshot: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.connections.iter_mut().find(|c| c.id == id) {
            entry.snapshot = snapshot;
        }
        state.prune_log();
    }

    pub(crate) fn remove_connection(&self, id: Uuid) {
        let mut state = self.state.lock();
        state.connections.retain(|c| c.id != id);
        state.prune_log();
    }

    pub(crate) fn current_registry(&self) -> Arc<ExtensionRegistry> {
        Arc::clone(&self.state.lock().extensions)
    }

    /// Queues a passive checkpoint unless one is already queued.
    fn schedule_checkpoint(&self) {
        if self.options.store.journal_mode != JournalMode::Wal {
            return;
        }
        if self.checkpoint_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let flag = Arc::clone(&self.checkpoint_pending);
        let accepted = self
            .checkpoint
            .handle()
            .try_push(Box::new(move |state: &mut CheckpointState| {
                flag.store(false, Ordering::Release);
                state.run_passive();
            }));
        if !accepted {
            self.checkpoint_pending.store(false, Ordering::Release);
        }
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if self.options.store.journal_mode == JournalMode::Wal {
            let _ = self
                .checkpoint
                .handle()
                .try_push(Box::new(|state: &mut CheckpointState| {
                    // Connections are gone; fold the whole log back into the
                    // main file so it reopens without one.
                    if let Err(e) = state.store.checkpoint(CheckpointMode::Truncate) {
                        debug!("final checkpoint skipped: {}", e);
                    }
                }));
        }
        // The checkpoint queue's own drop drains and joins.
    }
}

// ============================================================================
// Checkpoint worker
// ============================================================================

struct CheckpointState {
    store: Store,
}

impl CheckpointState {
    /// Passive checkpoint with backoff. Gives up quietly when readers keep
    /// the log busy; the next commit schedules another attempt.
    fn run_passive(&mut self) {
        let mut delay = Duration::from_millis(20);
        for _ in 0..CHECKPOINT_ATTEMPTS {
            match self.store.checkpoint(CheckpointMode::Passive) {
                Ok(outcome) if !outcome.busy => {
                    debug!(
                        log_frames = outcome.log_frames,
                        checkpointed = outcome.checkpointed_frames,
                        "checkpointed write-ahead log"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) if e.is_busy() => {}
                Err(e) => {
                    error!("checkpoint failed: {}", e);
                    return;
                }
            }
            std::thread::sleep(delay);
            delay *= 2;
        }
        debug!("write-ahead log busy, leaving checkpoint for later");
    }
}
