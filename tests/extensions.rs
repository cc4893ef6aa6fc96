//! Extension framework integration tests
//!
//! Drives the registration lifecycle, row hooks, changeset fan-out and orphan
//! cleanup with a small row-counting extension. The counter keeps its total
//! in memory per connection, persists it to its settings at commit, and ships
//! the new total to siblings through its changeset payload.

use std::any::Any;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use vantage::{
    CommitNotification, Database, Error, ExtContext, Extension, ExtensionChangeset,
    ExtensionConnection, ExtensionPayload, ExtensionTransaction, FlushLevel, Result, SettingValue,
};

// ============================================================================
// Row-counting mock extension
// ============================================================================

#[derive(Default)]
struct Tally {
    creates: usize,
    prepares: usize,
    inserts: usize,
    updates: usize,
    metadata_updates: usize,
    touches: usize,
    removes: usize,
    batch_removes: usize,
    clears: usize,
    pre_commits: usize,
    commits: usize,
    rollbacks: usize,
    /// Totals received through sibling changeset application.
    applied: Vec<u64>,
}

type SharedTally = Arc<Mutex<Tally>>;

struct RowCounter {
    sink: SharedTally,
}

impl RowCounter {
    fn new(sink: &SharedTally) -> Self {
        Self {
            sink: Arc::clone(sink),
        }
    }
}

impl Extension for RowCounter {
    fn class_name(&self) -> &'static str {
        "row_counter"
    }

    fn table_names(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }

    fn new_connection_state(&self, _name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(CounterConnection {
            sink: Arc::clone(&self.sink),
            rows: 0,
        })
    }
}

struct CounterConnection {
    sink: SharedTally,
    rows: u64,
}

impl ExtensionConnection for CounterConnection {
    fn begin(self: Box<Self>, _read_write: bool) -> Box<dyn ExtensionTransaction> {
        let rows_at_begin = self.rows;
        Box::new(CounterTransaction {
            state: *self,
            rows_at_begin,
            dirty: false,
        })
    }

    fn apply_changeset(&mut self, payload: &ExtensionPayload) {
        if let Some(rows) = payload.downcast_ref::<u64>() {
            self.rows = *rows;
            self.sink.lock().unwrap().applied.push(*rows);
        }
    }

    fn flush(&mut self, _level: FlushLevel) {}
}

struct CounterTransaction {
    state: CounterConnection,
    rows_at_begin: u64,
    dirty: bool,
}

const SETTING_ROWS: &str = "rows";

impl ExtensionTransaction for CounterTransaction {
    fn create_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        self.state.sink.lock().unwrap().creates += 1;
        let rows = ctx.store().row_count()?;
        self.state.rows = rows;
        self.rows_at_begin = rows;
        self.dirty = true;
        Ok(())
    }

    fn prepare_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        self.state.sink.lock().unwrap().prepares += 1;
        if let Some(SettingValue::Int(rows)) = ctx.get_setting(SETTING_ROWS)? {
            if !self.dirty {
                self.state.rows = rows as u64;
                self.rows_at_begin = self.state.rows;
            }
        }
        Ok(())
    }

    fn on_insert(
        &mut self,
        _ctx: &mut ExtContext<'_>,
        _key: &str,
        _rowid: i64,
        _data: &[u8],
        _metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.state.sink.lock().unwrap().inserts += 1;
        self.state.rows += 1;
        self.dirty = true;
        Ok(())
    }

    fn on_update(
        &mut self,
        _ctx: &mut ExtContext<'_>,
        _key: &str,
        _rowid: i64,
        _data: &[u8],
        _metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.state.sink.lock().unwrap().updates += 1;
        Ok(())
    }

    fn on_update_metadata_only(
        &mut self,
        _ctx: &mut ExtContext<'_>,
        _key: &str,
        _rowid: i64,
        _metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.state.sink.lock().unwrap().metadata_updates += 1;
        Ok(())
    }

    fn on_touch(&mut self, _ctx: &mut ExtContext<'_>, _key: &str, _rowid: i64) -> Result<()> {
        self.state.sink.lock().unwrap().touches += 1;
        Ok(())
    }

    fn on_remove(&mut self, _ctx: &mut ExtContext<'_>, _key: &str, _rowid: i64) -> Result<()> {
        self.state.sink.lock().unwrap().removes += 1;
        self.state.rows = self.state.rows.saturating_sub(1);
        self.dirty = true;
        Ok(())
    }

    fn on_remove_many(&mut self, _ctx: &mut ExtContext<'_>, rows: &[(String, i64)]) -> Result<()> {
        self.state.sink.lock().unwrap().batch_removes += 1;
        self.state.rows = self.state.rows.saturating_sub(rows.len() as u64);
        self.dirty = true;
        Ok(())
    }

    fn on_remove_all(&mut self, _ctx: &mut ExtContext<'_>) -> Result<()> {
        self.state.sink.lock().unwrap().clears += 1;
        self.state.rows = 0;
        self.dirty = true;
        Ok(())
    }

    fn pre_commit(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        self.state.sink.lock().unwrap().pre_commits += 1;
        if self.dirty {
            ctx.set_setting(SETTING_ROWS, &SettingValue::Int(self.state.rows as i64))?;
        }
        Ok(())
    }

    fn changeset(&mut self) -> ExtensionChangeset {
        if !self.dirty {
            return ExtensionChangeset::default();
        }
        let total: ExtensionPayload = Arc::new(self.state.rows);
        ExtensionChangeset {
            internal: Some(Arc::clone(&total)),
            external: Some(total),
            has_disk_changes: true,
        }
    }

    fn commit(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        let this = *self;
        this.state.sink.lock().unwrap().commits += 1;
        Box::new(this.state)
    }

    fn rollback(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        let mut this = *self;
        this.state.sink.lock().unwrap().rollbacks += 1;
        this.state.rows = this.rows_at_begin;
        Box::new(this.state)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A second class with no behavior, for name reuse checks.
struct NullIndex;

struct NullState;

impl Extension for NullIndex {
    fn class_name(&self) -> &'static str {
        "null_index"
    }

    fn table_names(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }

    fn new_connection_state(&self, _name: &str) -> Box<dyn ExtensionConnection> {
        Box::new(NullState)
    }
}

impl ExtensionConnection for NullState {
    fn begin(self: Box<Self>, _read_write: bool) -> Box<dyn ExtensionTransaction> {
        Box::new(NullState)
    }

    fn apply_changeset(&mut self, _payload: &ExtensionPayload) {}

    fn flush(&mut self, _level: FlushLevel) {}
}

impl ExtensionTransaction for NullState {
    fn commit(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        self
    }

    fn rollback(self: Box<Self>) -> Box<dyn ExtensionConnection> {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn open_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("ext.db")).expect("open");
    (dir, db)
}

/// Reads the counter's in-memory total through the typed extension surface.
fn counted_rows(conn: &vantage::Connection, name: &'static str) -> u64 {
    conn.read(move |txn| {
        let rows = txn.with_extension(name, |ext, _ctx| {
            ext.as_any_mut()
                .downcast_mut::<CounterTransaction>()
                .expect("counter transaction")
                .state
                .rows
        })?;
        Ok(rows.expect("extension registered"))
    })
    .expect("read")
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_registration_creates_and_counts_existing_rows() {
    let (_dir, db) = open_db();
    let conn = db.connection().unwrap();
    conn.read_write(|txn| {
        txn.set("a", b"1", None)?;
        txn.set("b", b"2", None)
    })
    .unwrap();

    let sink = SharedTally::default();
    assert!(db.registered_extension_names().is_empty());
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    {
        let t = sink.lock().unwrap();
        assert_eq!(t.creates, 1);
        assert_eq!(t.prepares, 1);
        assert_eq!(t.pre_commits, 1);
        assert_eq!(t.commits, 1);
        assert_eq!(t.rollbacks, 0);
    }
    assert_eq!(db.registered_extension_names(), vec!["tally".to_string()]);
    assert_eq!(counted_rows(&conn, "tally"), 2);
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let (_dir, db) = open_db();
    let sink = SharedTally::default();
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    let result = db.register_extension("tally", RowCounter::new(&sink));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_invalid_names_are_rejected() {
    let (_dir, db) = open_db();
    let sink = SharedTally::default();
    for name in ["", "bad-name", "bad name", "bad\"quote"] {
        let result = db.register_extension(name, RowCounter::new(&sink));
        assert!(matches!(result, Err(Error::Config(_))), "name {:?}", name);
    }
}

#[test]
fn test_with_extension_on_unknown_name_returns_none() {
    let (_dir, db) = open_db();
    let conn = db.connection().unwrap();
    let hit = conn
        .read(|txn| txn.with_extension("ghost", |_ext, _ctx| ()))
        .unwrap();
    assert!(hit.is_none());
}

// ============================================================================
// Hooks
// ============================================================================

#[test]
fn test_hooks_fire_once_per_mutation() {
    let (_dir, db) = open_db();
    let sink = SharedTally::default();
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    let conn = db.connection().unwrap();

    conn.read_write(|txn| {
        txn.set("a", b"1", None)?;
        txn.set("a", b"2", None)?;
        txn.set_metadata("a", Some(b"m"))?;
        txn.touch("a")?;
        txn.set("b", b"1", None)?;
        txn.remove("a")?;
        txn.remove_many(["b"])?;
        txn.set("c", b"1", None)?;
        txn.remove_all()
    })
    .unwrap();

    let t = sink.lock().unwrap();
    assert_eq!(t.inserts, 3);
    assert_eq!(t.updates, 1);
    assert_eq!(t.metadata_updates, 1);
    assert_eq!(t.touches, 1);
    assert_eq!(t.removes, 1);
    assert_eq!(t.batch_removes, 1);
    assert_eq!(t.clears, 1);
    drop(t);
    assert_eq!(counted_rows(&conn, "tally"), 0);
}

#[test]
fn test_rollback_restores_extension_state() {
    let (_dir, db) = open_db();
    let conn = db.connection().unwrap();
    conn.read_write(|txn| txn.set("seed", b"v", None)).unwrap();

    let sink = SharedTally::default();
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    assert_eq!(counted_rows(&conn, "tally"), 1);

    let result: vantage::Result<()> = conn.read_write(|txn| {
        txn.set("extra", b"v", None)?;
        Err(Error::config("abort"))
    });
    assert!(result.is_err());
    assert!(sink.lock().unwrap().rollbacks >= 1);
    assert_eq!(counted_rows(&conn, "tally"), 1);
}

// ============================================================================
// Changeset fan-out
// ============================================================================

#[test]
fn test_payload_reaches_observers_and_siblings() {
    let (_dir, db) = open_db();
    let sink = SharedTally::default();
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    let writer = db.connection().unwrap();
    let reader = db.connection().unwrap();

    let seen: Arc<Mutex<Vec<Arc<CommitNotification>>>> = Arc::new(Mutex::new(Vec::new()));
    let observer_sink = Arc::clone(&seen);
    db.add_commit_observer(move |n| observer_sink.lock().unwrap().push(Arc::clone(n)));

    writer.read_write(|txn| txn.set("k", b"v", None)).unwrap();

    let notifications = seen.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    let payload = notifications[0].extension_payload("tally").unwrap();
    assert_eq!(payload.downcast_ref::<u64>(), Some(&1));
    drop(notifications);

    // Forces the reader's queued fan-out work to run first.
    assert_eq!(reader.snapshot(), 2);
    assert!(sink.lock().unwrap().applied.contains(&1));
}

// ============================================================================
// Persistence and orphan cleanup
// ============================================================================

#[test]
fn test_orphaned_state_is_reported_and_removable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext.db");
    {
        let db = Database::open(&path).unwrap();
        let sink = SharedTally::default();
        db.register_extension("tally", RowCounter::new(&sink)).unwrap();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| txn.set("k", b"v", None)).unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.previously_registered_extensions(), vec!["tally".to_string()]);
    let conn = db.connection().unwrap();
    let hit = conn
        .read(|txn| txn.with_extension("tally", |_ext, _ctx| ()))
        .unwrap();
    assert!(hit.is_none());

    // Settings from the earlier run still pin the name to its class.
    let result = db.register_extension("tally", NullIndex);
    assert!(matches!(result, Err(Error::Config(_))));

    db.unregister_extension("tally").unwrap();
    assert!(db.registered_extension_names().is_empty());
    db.register_extension("tally", NullIndex).unwrap();
    assert_eq!(db.registered_extension_names(), vec!["tally".to_string()]);
}

#[test]
fn test_unregister_unknown_name_is_an_error() {
    let (_dir, db) = open_db();
    let result = db.unregister_extension("ghost");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_persisted_total_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext.db");
    {
        let db = Database::open(&path).unwrap();
        let sink = SharedTally::default();
        db.register_extension("tally", RowCounter::new(&sink)).unwrap();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            txn.set("a", b"1", None)?;
            txn.set("b", b"2", None)
        })
        .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let sink = SharedTally::default();
    db.register_extension("tally", RowCounter::new(&sink)).unwrap();
    let conn = db.connection().unwrap();
    // create_if_needed recounts, and the persisted setting agrees with it.
    assert_eq!(counted_rows(&conn, "tally"), 2);
}
