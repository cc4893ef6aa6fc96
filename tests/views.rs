//! View extension integration tests
//!
//! Registers real views against the engine and checks grouping, sort order,
//! the per-commit change lists, page splitting under small page sizes, and
//! index persistence across reopens.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use vantage::{
    CommitNotification, Database, Error, Grouping, RowChange, Sorting, View, ViewAccess,
    ViewChanges, ViewOptions,
};

// ============================================================================
// Helpers
// ============================================================================

type NotificationLog = Arc<Mutex<Vec<Arc<CommitNotification>>>>;

fn open_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("views.db")).expect("open");
    (dir, db)
}

fn record_commits(db: &Database) -> NotificationLog {
    let log: NotificationLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    db.add_commit_observer(move |n| sink.lock().unwrap().push(Arc::clone(n)));
    log
}

fn last_view_changes(log: &NotificationLog, view: &str) -> Arc<ViewChanges> {
    let notifications = log.lock().unwrap();
    let newest = notifications.last().expect("at least one commit");
    ViewChanges::from_notification(newest, view).expect("view payload")
}

/// Groups keys by the text before the first colon; keys without one stay out
/// of the view. Rows sort by key within each group.
fn prefix_view() -> View {
    View::new(
        Grouping::by_key(|key| key.split_once(':').map(|(prefix, _)| prefix.to_string())),
        Sorting::by_key(|_group, a, b| a.cmp(b)),
    )
}

/// Groups every row under "all", ordered by data bytes then key.
fn data_ordered_view() -> View {
    View::new(
        Grouping::by_key(|_| Some("all".to_string())),
        Sorting::by_data(|_group, a_key, a_data, b_key, b_data| {
            a_data.cmp(b_data).then_with(|| a_key.cmp(b_key))
        }),
    )
}

fn insert(conn: &vantage::Connection, key: &'static str, data: &'static [u8]) {
    conn.read_write(move |txn| txn.set(key, data, None)).unwrap();
}

fn keys_of(conn: &vantage::Connection, view: &'static str, group: &'static str) -> Vec<String> {
    conn.read(move |txn| {
        let mut handle = txn.view(view)?;
        let mut keys = Vec::new();
        handle.enumerate_keys(group, |_index, key| {
            keys.push(key.to_string());
            true
        })?;
        Ok(keys)
    })
    .unwrap()
}

// ============================================================================
// Registration
// ============================================================================

mod registration {
    use super::*;

    #[test]
    fn test_register_populates_from_existing_rows() {
        let (_dir, db) = open_db();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            txn.set("fruit:apple", b"1", None)?;
            txn.set("fruit:banana", b"2", None)?;
            txn.set("veg:carrot", b"3", None)?;
            txn.set("plain", b"4", None)
        })
        .unwrap();

        let log = record_commits(&db);
        db.register_extension("order", prefix_view()).unwrap();

        let changes = last_view_changes(&log, "order");
        assert!(changes.reset);
        assert!(changes.changes.is_empty());

        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert_eq!(view.group_count()?, 2);
            assert_eq!(view.groups()?, vec!["fruit".to_string(), "veg".to_string()]);
            assert_eq!(view.len("fruit")?, 2);
            assert_eq!(view.len("veg")?, 1);
            assert_eq!(view.total_len()?, 3);
            assert!(!view.contains_key("plain")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_key_at_and_index_of_agree() {
        let (_dir, db) = open_db();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            for key in ["fruit:cherry", "fruit:apple", "veg:beet", "fruit:banana"] {
                txn.set(key, b"x", None)?;
            }
            Ok(())
        })
        .unwrap();
        db.register_extension("order", prefix_view()).unwrap();

        conn.read(|txn| {
            let mut view = txn.view("order")?;
            for group in view.groups()? {
                for index in 0..view.len(&group)? {
                    let key = view.key_at(&group, index)?.expect("within bounds");
                    assert_eq!(view.index_of(&key)?, Some((group.clone(), index)));
                }
            }
            assert!(view.key_at("fruit", 99)?.is_none());
            assert!(view.index_of("fruit:durian")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unknown_view_name_is_a_config_error() {
        let (_dir, db) = open_db();
        let conn = db.connection().unwrap();
        let config_err = conn
            .read(|txn| match txn.view("ghost") {
                Ok(_) => Ok(false),
                Err(Error::Config(_)) => Ok(true),
                Err(e) => Err(e),
            })
            .unwrap();
        assert!(config_err);
    }

    #[test]
    fn test_first_and_last_key() {
        let (_dir, db) = open_db();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            txn.set("fruit:banana", b"1", None)?;
            txn.set("fruit:apple", b"2", None)
        })
        .unwrap();
        db.register_extension("order", prefix_view()).unwrap();

        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert_eq!(view.first_key("fruit")?.as_deref(), Some("fruit:apple"));
            assert_eq!(view.last_key("fruit")?.as_deref(), Some("fruit:banana"));
            assert!(view.first_key("empty")?.is_none());
            assert!(view.last_key("empty")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_data_at_reads_the_row() {
        let (_dir, db) = open_db();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| txn.set("fruit:apple", b"crisp", None))
            .unwrap();
        db.register_extension("order", prefix_view()).unwrap();

        let data = conn
            .read(|txn| {
                let mut view = txn.view("order")?;
                view.data_at("fruit", 0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], b"crisp");
    }
}

// ============================================================================
// Mutations
// ============================================================================

mod mutations {
    use super::*;

    #[test]
    fn test_inserts_land_in_sort_order() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let conn = db.connection().unwrap();
        let log = record_commits(&db);

        conn.read_write(|txn| {
            txn.set("fruit:cherry", b"1", None)?;
            txn.set("fruit:apple", b"2", None)?;
            txn.set("fruit:banana", b"3", None)
        })
        .unwrap();

        assert_eq!(
            keys_of(&conn, "order", "fruit"),
            vec!["fruit:apple", "fruit:banana", "fruit:cherry"]
        );

        let changes = last_view_changes(&log, "order");
        assert!(!changes.reset);
        assert_eq!(
            changes.changes,
            vec![
                RowChange::Insert {
                    group: "fruit".to_string(),
                    index: 0,
                    key: "fruit:cherry".to_string(),
                },
                RowChange::Insert {
                    group: "fruit".to_string(),
                    index: 0,
                    key: "fruit:apple".to_string(),
                },
                RowChange::Insert {
                    group: "fruit".to_string(),
                    index: 1,
                    key: "fruit:banana".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_data_update_with_key_sorting_stays_put() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "fruit:apple", b"v1");
        let log = record_commits(&db);

        insert(&conn, "fruit:apple", b"v2");

        let changes = last_view_changes(&log, "order");
        assert_eq!(
            changes.changes,
            vec![RowChange::Update {
                group: "fruit".to_string(),
                index: 0,
                key: "fruit:apple".to_string(),
            }]
        );
    }

    #[test]
    fn test_data_change_moves_the_row() {
        let (_dir, db) = open_db();
        db.register_extension("order", data_ordered_view()).unwrap();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            txn.set("k1", b"1", None)?;
            txn.set("k2", b"2", None)?;
            txn.set("k3", b"3", None)
        })
        .unwrap();
        let log = record_commits(&db);

        insert(&conn, "k1", b"9");

        assert_eq!(keys_of(&conn, "order", "all"), vec!["k2", "k3", "k1"]);
        let changes = last_view_changes(&log, "order");
        assert_eq!(
            changes.changes,
            vec![RowChange::Move {
                group: "all".to_string(),
                from: 0,
                to: 2,
                key: "k1".to_string(),
            }]
        );
    }

    #[test]
    fn test_group_change_is_delete_then_insert() {
        let (_dir, db) = open_db();
        let by_data_group = View::new(
            Grouping::by_data(|_key, data| {
                std::str::from_utf8(&data[..1]).ok().map(str::to_string)
            }),
            Sorting::by_key(|_group, a, b| a.cmp(b)),
        );
        db.register_extension("order", by_data_group).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "k", b"a-side");
        let log = record_commits(&db);

        insert(&conn, "k", b"b-side");

        let changes = last_view_changes(&log, "order");
        assert_eq!(
            changes.changes,
            vec![
                RowChange::Delete {
                    group: "a".to_string(),
                    index: 0,
                    key: "k".to_string(),
                },
                RowChange::Insert {
                    group: "b".to_string(),
                    index: 0,
                    key: "k".to_string(),
                },
            ]
        );
        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert_eq!(view.groups()?, vec!["b".to_string()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_metadata_sorting_reorders_on_metadata_update() {
        let (_dir, db) = open_db();
        let by_metadata = View::new(
            Grouping::by_key(|_| Some("all".to_string())),
            Sorting::by_metadata(|_group, a_key, a_meta, b_key, b_meta| {
                a_meta.cmp(&b_meta).then_with(|| a_key.cmp(b_key))
            }),
        );
        db.register_extension("order", by_metadata).unwrap();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            txn.set("k1", b"v", Some(b"2"))?;
            txn.set("k2", b"v", Some(b"1"))
        })
        .unwrap();
        assert_eq!(keys_of(&conn, "order", "all"), vec!["k2", "k1"]);

        conn.read_write(|txn| txn.set_metadata("k1", Some(b"0")))
            .unwrap();
        assert_eq!(keys_of(&conn, "order", "all"), vec!["k1", "k2"]);
    }

    #[test]
    fn test_row_leaving_the_view_is_a_delete() {
        let (_dir, db) = open_db();
        let opt_in = View::new(
            Grouping::by_data(|_key, data| {
                if data.starts_with(b"x") {
                    None
                } else {
                    Some("all".to_string())
                }
            }),
            Sorting::by_key(|_group, a, b| a.cmp(b)),
        );
        db.register_extension("order", opt_in).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "k", b"keep");
        let log = record_commits(&db);

        insert(&conn, "k", b"xgone");
        let changes = last_view_changes(&log, "order");
        assert_eq!(
            changes.changes,
            vec![RowChange::Delete {
                group: "all".to_string(),
                index: 0,
                key: "k".to_string(),
            }]
        );
        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert!(view.is_empty()?);
            assert!(!view.contains_key("k")?);
            Ok(())
        })
        .unwrap();

        insert(&conn, "k", b"back");
        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert_eq!(view.total_len()?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_remove_all_resets_the_view() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "fruit:apple", b"1");
        insert(&conn, "veg:beet", b"2");
        let log = record_commits(&db);

        conn.read_write(|txn| txn.remove_all()).unwrap();

        let changes = last_view_changes(&log, "order");
        assert!(changes.reset);
        assert!(changes.changes.is_empty());
        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert!(view.is_empty()?);
            assert_eq!(view.group_count()?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rollback_leaves_the_view_untouched() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "fruit:apple", b"1");
        insert(&conn, "fruit:cherry", b"2");

        let result: vantage::Result<()> = conn.read_write(|txn| {
            txn.set("fruit:banana", b"3", None)?;
            txn.remove("fruit:apple")?;
            Err(Error::config("abort"))
        });
        assert!(result.is_err());

        assert_eq!(keys_of(&conn, "order", "fruit"), vec!["fruit:apple", "fruit:cherry"]);
        conn.read(|txn| {
            let mut view = txn.view("order")?;
            assert_eq!(view.index_of("fruit:banana")?, None);
            assert_eq!(view.index_of("fruit:apple")?, Some(("fruit".to_string(), 0)));
            Ok(())
        })
        .unwrap();

        // the connection's view state is still usable for the next write
        insert(&conn, "fruit:banana", b"3");
        assert_eq!(
            keys_of(&conn, "order", "fruit"),
            vec!["fruit:apple", "fruit:banana", "fruit:cherry"]
        );
    }
}

// ============================================================================
// Paging
// ============================================================================

mod paging {
    use super::*;

    #[test]
    fn test_small_pages_split_and_keep_order() {
        let (_dir, db) = open_db();
        let view = View::with_options(
            Grouping::by_key(|_| Some("all".to_string())),
            Sorting::by_key(|_group, a, b| a.cmp(b)),
            ViewOptions {
                max_page_size: 4,
                ..ViewOptions::default()
            },
        );
        db.register_extension("order", view).unwrap();
        let conn = db.connection().unwrap();

        // A fixed scramble so inserts land on both edges and in the middle.
        let mut keys: Vec<String> = (0..25).map(|i| format!("k{:02}", i)).collect();
        for chunk in [17, 3, 22, 9] {
            keys.swap(chunk, 24 - chunk % 5);
        }
        let scrambled = keys.clone();
        conn.read_write(move |txn| {
            for key in &scrambled {
                txn.set(key, b"v", None)?;
            }
            Ok(())
        })
        .unwrap();

        let mut expected: Vec<String> = (0..25).map(|i| format!("k{:02}", i)).collect();
        expected.sort();
        assert_eq!(keys_of(&conn, "order", "all"), expected);

        conn.read(|txn| {
            let mut view = txn.view("order")?;
            for index in [0, 7, 13, 24] {
                let key = view.key_at("all", index)?.expect("within bounds");
                assert_eq!(view.index_of(&key)?, Some(("all".to_string(), index)));
            }
            Ok(())
        })
        .unwrap();

        // Shrinking below page boundaries must keep the chain consistent.
        conn.read_write(|txn| {
            for i in (0..25).step_by(2) {
                txn.remove(&format!("k{:02}", i))?;
            }
            Ok(())
        })
        .unwrap();
        let remaining: Vec<String> = (0..25)
            .filter(|i| i % 2 == 1)
            .map(|i| format!("k{:02}", i))
            .collect();
        assert_eq!(keys_of(&conn, "order", "all"), remaining);
    }

    #[test]
    fn test_enumerate_range_and_reversal() {
        let (_dir, db) = open_db();
        let view = View::with_options(
            Grouping::by_key(|_| Some("all".to_string())),
            Sorting::by_key(|_group, a, b| a.cmp(b)),
            ViewOptions {
                max_page_size: 3,
                ..ViewOptions::default()
            },
        );
        db.register_extension("order", view).unwrap();
        let conn = db.connection().unwrap();
        conn.read_write(|txn| {
            for i in 0..10 {
                txn.set(&format!("k{}", i), b"v", None)?;
            }
            Ok(())
        })
        .unwrap();

        let forward = conn
            .read(|txn| {
                let mut view = txn.view("order")?;
                let mut seen = Vec::new();
                view.enumerate_keys_range("all", 2..6, false, |index, key| {
                    seen.push((index, key.to_string()));
                    true
                })?;
                Ok(seen)
            })
            .unwrap();
        assert_eq!(
            forward,
            vec![
                (2, "k2".to_string()),
                (3, "k3".to_string()),
                (4, "k4".to_string()),
                (5, "k5".to_string()),
            ]
        );

        let backward = conn
            .read(|txn| {
                let mut view = txn.view("order")?;
                let mut seen = Vec::new();
                view.enumerate_keys_range("all", 2..6, true, |index, key| {
                    seen.push((index, key.to_string()));
                    true
                })?;
                Ok(seen)
            })
            .unwrap();
        assert_eq!(
            backward,
            vec![
                (5, "k5".to_string()),
                (4, "k4".to_string()),
                (3, "k3".to_string()),
                (2, "k2".to_string()),
            ]
        );
    }
}

// ============================================================================
// Persistence
// ============================================================================

mod persistence {
    use super::*;

    #[test]
    fn test_persistent_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.db");
        {
            let db = Database::open(&path).unwrap();
            db.register_extension("order", prefix_view()).unwrap();
            let conn = db.connection().unwrap();
            conn.read_write(|txn| {
                txn.set("fruit:cherry", b"1", None)?;
                txn.set("fruit:apple", b"2", None)
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let log = record_commits(&db);
        db.register_extension("order", prefix_view()).unwrap();

        // Same version, persisted index: re-registration publishes nothing.
        let notifications = log.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].extension_payload("order").is_none());
        drop(notifications);

        let conn = db.connection().unwrap();
        assert_eq!(
            keys_of(&conn, "order", "fruit"),
            vec!["fruit:apple", "fruit:cherry"]
        );
    }

    #[test]
    fn test_version_bump_rebuilds_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.db");
        {
            let db = Database::open(&path).unwrap();
            db.register_extension("order", prefix_view()).unwrap();
            let conn = db.connection().unwrap();
            conn.read_write(|txn| txn.set("fruit:apple", b"1", None))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let log = record_commits(&db);
        let rebuilt = View::with_options(
            Grouping::by_key(|key| key.split_once(':').map(|(prefix, _)| prefix.to_string())),
            Sorting::by_key(|_group, a, b| b.cmp(a)),
            ViewOptions {
                version: 1,
                ..ViewOptions::default()
            },
        );
        db.register_extension("order", rebuilt).unwrap();

        let changes = last_view_changes(&log, "order");
        assert!(changes.reset);
        let conn = db.connection().unwrap();
        assert_eq!(keys_of(&conn, "order", "fruit"), vec!["fruit:apple"]);
    }

    #[test]
    fn test_non_persistent_view_rebuilds_every_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.db");
        let scratch = || {
            View::with_options(
                Grouping::by_key(|key| key.split_once(':').map(|(prefix, _)| prefix.to_string())),
                Sorting::by_key(|_group, a, b| a.cmp(b)),
                ViewOptions {
                    persistent: false,
                    ..ViewOptions::default()
                },
            )
        };
        {
            let db = Database::open(&path).unwrap();
            db.register_extension("order", scratch()).unwrap();
            let conn = db.connection().unwrap();
            conn.read_write(|txn| txn.set("fruit:apple", b"1", None))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let log = record_commits(&db);
        db.register_extension("order", scratch()).unwrap();
        let changes = last_view_changes(&log, "order");
        assert!(changes.reset);
    }

    #[test]
    fn test_unregister_then_view_errors() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let conn = db.connection().unwrap();
        insert(&conn, "fruit:apple", b"1");

        db.unregister_extension("order").unwrap();
        let config_err = conn
            .read(|txn| match txn.view("order") {
                Ok(_) => Ok(false),
                Err(Error::Config(_)) => Ok(true),
                Err(e) => Err(e),
            })
            .unwrap();
        assert!(config_err);
    }
}

// ============================================================================
// Coherence across connections
// ============================================================================

mod coherence {
    use super::*;

    #[test]
    fn test_sibling_sees_view_changes_after_commit() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let writer = db.connection().unwrap();
        let reader = db.connection().unwrap();

        insert(&writer, "fruit:banana", b"1");
        assert_eq!(keys_of(&reader, "order", "fruit"), vec!["fruit:banana"]);

        insert(&writer, "fruit:apple", b"2");
        assert_eq!(
            keys_of(&reader, "order", "fruit"),
            vec!["fruit:apple", "fruit:banana"]
        );
    }

    #[test]
    fn test_long_lived_read_pins_the_view() {
        let (_dir, db) = open_db();
        db.register_extension("order", prefix_view()).unwrap();
        let writer = db.connection().unwrap();
        let reader = db.connection().unwrap();
        insert(&writer, "fruit:apple", b"1");

        assert!(reader.begin_long_lived_read().unwrap().is_empty());
        insert(&writer, "fruit:banana", b"2");

        let pinned_len = reader
            .read(|txn| {
                let mut view = txn.view("order")?;
                view.len("fruit")
            })
            .unwrap();
        assert_eq!(pinned_len, 1);

        let missed = reader.end_long_lived_read();
        assert_eq!(missed.len(), 1);
        assert!(ViewChanges::from_notification(&missed[0], "order").is_some());

        let fresh_len = reader
            .read(|txn| {
                let mut view = txn.view("order")?;
                view.len("fruit")
            })
            .unwrap();
        assert_eq!(fresh_len, 2);
    }
}
