//! Mappings integration tests
//!
//! Projects a live view into sections and rows the way a list UI would
//! consume it: declared and dynamic groups, range windows, reversal, and
//! the row/index arithmetic in both directions.

use tempfile::TempDir;

use vantage::{
    Connection, Database, Grouping, Mappings, RangePin, Sorting, View, ViewRange, SNAPSHOT_UNSET,
};

// ============================================================================
// Helpers
// ============================================================================

/// Opens a database with a "order" view grouping keys by their prefix before
/// the colon, and seeds five news rows and three blog rows. No misc rows.
fn seed_db() -> (TempDir, Database, Connection) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("mappings.db")).expect("open");
    let view = View::new(
        Grouping::by_key(|key| key.split_once(':').map(|(prefix, _)| prefix.to_string())),
        Sorting::by_key(|_group, a, b| a.cmp(b)),
    );
    db.register_extension("order", view).unwrap();
    let conn = db.connection().unwrap();
    conn.read_write(|txn| {
        for key in [
            "news:a", "news:b", "news:c", "news:d", "news:e", "blog:a", "blog:b", "blog:c",
        ] {
            txn.set(key, b"v", None)?;
        }
        Ok(())
    })
    .unwrap();
    (dir, db, conn)
}

fn declared() -> Mappings {
    Mappings::new(
        "order",
        vec!["news".to_string(), "blog".to_string(), "misc".to_string()],
    )
}

/// Refreshes mappings inside a read transaction and hands them back, the
/// shape a UI layer uses to keep its projection in step with its data reads.
fn refresh(conn: &Connection, mappings: Mappings) -> Mappings {
    conn.read(move |txn| {
        let mut mappings = mappings;
        mappings.update_with_transaction(txn)?;
        Ok(mappings)
    })
    .unwrap()
}

// ============================================================================
// Sections
// ============================================================================

mod sections {
    use super::*;

    #[test]
    fn test_declared_groups_become_sections_in_order() {
        let (_dir, _db, conn) = seed_db();
        let mappings = declared();
        assert_eq!(mappings.snapshot_of_last_update(), SNAPSHOT_UNSET);

        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.snapshot_of_last_update(), conn.snapshot());
        assert_eq!(mappings.section_count(), 3);
        assert_eq!(mappings.group_for_section(0), Some("news"));
        assert_eq!(mappings.group_for_section(1), Some("blog"));
        assert_eq!(mappings.group_for_section(2), Some("misc"));
        assert_eq!(mappings.section_for_group("blog"), Some(1));
        assert_eq!(mappings.items_in_section(0), Some(5));
        assert_eq!(mappings.items_in_section(1), Some(3));
        assert_eq!(mappings.items_in_section(2), Some(0));
        assert_eq!(mappings.items_in_section(3), None);
        assert!(mappings.is_group_visible("misc"));
        assert_eq!(mappings.full_count_for_group("misc"), 0);
        assert_eq!(
            mappings.visible_groups(),
            &["news".to_string(), "blog".to_string(), "misc".to_string()]
        );
    }

    #[test]
    fn test_dynamic_group_hides_while_empty() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_group_dynamic("misc", true);

        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.section_count(), 2);
        assert!(!mappings.is_group_visible("misc"));
        assert_eq!(mappings.section_for_group("misc"), None);
        assert_eq!(mappings.group_for_section(1), Some("blog"));

        // The section reappears in declared order once the group has a row.
        conn.read_write(|txn| txn.set("misc:a", b"v", None)).unwrap();
        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.section_count(), 3);
        assert_eq!(mappings.group_for_section(2), Some("misc"));
        assert_eq!(mappings.items_in_section(2), Some(1));
    }

    #[test]
    fn test_dynamic_mappings_discover_groups() {
        let (_dir, _db, conn) = seed_db();
        let mappings = Mappings::dynamic("order", |group| group != "blog", |a, b| a.cmp(b));
        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.section_count(), 1);
        assert_eq!(mappings.group_for_section(0), Some("news"));
        assert!(!mappings.is_group_visible("blog"));

        let descending = Mappings::dynamic("order", |_| true, |a, b| b.cmp(a));
        let descending = refresh(&conn, descending);
        assert_eq!(
            descending.visible_groups(),
            &["news".to_string(), "blog".to_string()]
        );
    }

    #[test]
    fn test_counts_are_stale_until_refreshed() {
        let (_dir, _db, conn) = seed_db();
        let mappings = refresh(&conn, declared());
        assert_eq!(mappings.full_count_for_group("news"), 5);

        conn.read_write(|txn| txn.set("news:f", b"v", None)).unwrap();
        assert_eq!(mappings.full_count_for_group("news"), 5);

        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.full_count_for_group("news"), 6);
    }
}

// ============================================================================
// Ranges
// ============================================================================

mod ranges {
    use super::*;

    #[test]
    fn test_fixed_range_pinned_to_the_end() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_range("news", ViewRange::fixed(2, RangePin::End));
        let mappings = refresh(&conn, mappings);

        // news has 5 rows; the window shows the last two, indices 3 and 4.
        assert_eq!(mappings.items_in_section(0), Some(2));
        assert_eq!(mappings.visible_count_for_group("news"), 2);
        assert_eq!(mappings.full_count_for_group("news"), 5);
        assert_eq!(mappings.index_for_row(0, 0), Some(3));
        assert_eq!(mappings.index_for_row(1, 0), Some(4));
        assert_eq!(mappings.index_for_row(2, 0), None);
        assert_eq!(mappings.row_for_index(3, "news"), Some(0));
        assert_eq!(mappings.row_for_index(4, "news"), Some(1));
        assert_eq!(mappings.row_for_index(2, "news"), None);
    }

    #[test]
    fn test_fixed_range_with_offset() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_range("news", ViewRange::fixed_with_offset(2, 1, RangePin::Beginning));
        let mappings = refresh(&conn, mappings);

        // Skip the first row, then show two: indices 1 and 2.
        assert_eq!(mappings.items_in_section(0), Some(2));
        assert_eq!(mappings.index_for_row(0, 0), Some(1));
        assert_eq!(mappings.index_for_row(1, 0), Some(2));
        assert_eq!(mappings.row_for_index(0, "news"), None);
        assert_eq!(mappings.row_for_index(1, "news"), Some(0));
    }

    #[test]
    fn test_flexible_range_grows_to_its_cap() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_range("news", ViewRange::flexible(10, RangePin::Beginning));
        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.items_in_section(0), Some(5));

        let mut capped = declared();
        capped.set_range("news", ViewRange::flexible(3, RangePin::Beginning));
        let capped = refresh(&conn, capped);
        assert_eq!(capped.items_in_section(0), Some(3));
        assert_eq!(capped.index_for_row(2, 0), Some(2));
        assert_eq!(capped.index_for_row(3, 0), None);
    }

    #[test]
    fn test_removing_the_range_shows_the_whole_group() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_range("news", ViewRange::fixed(2, RangePin::End));
        assert!(mappings.range_for_group("news").is_some());

        mappings.remove_range("news");
        assert!(mappings.range_for_group("news").is_none());
        let mappings = refresh(&conn, mappings);
        assert_eq!(mappings.items_in_section(0), Some(5));
        assert_eq!(mappings.index_for_row(4, 0), Some(4));
    }
}

// ============================================================================
// Reversal
// ============================================================================

mod reversal {
    use super::*;

    #[test]
    fn test_reversed_group_flips_rows() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_reversed("news", true);
        assert!(mappings.is_reversed("news"));
        let mappings = refresh(&conn, mappings);

        assert_eq!(mappings.items_in_section(0), Some(5));
        assert_eq!(mappings.index_for_row(0, 0), Some(4));
        assert_eq!(mappings.index_for_row(4, 0), Some(0));
        assert_eq!(mappings.row_for_index(0, "news"), Some(4));
        assert_eq!(mappings.row_for_index(4, "news"), Some(0));
    }

    #[test]
    fn test_reversed_end_pin_anchors_to_displayed_end() {
        let (_dir, _db, conn) = seed_db();
        let mut mappings = declared();
        mappings.set_reversed("news", true);
        mappings.set_range("news", ViewRange::fixed(2, RangePin::End));
        let mappings = refresh(&conn, mappings);

        // Displayed order runs 4,3,2,1,0; the displayed end is global index
        // 0, so the window covers global rows 1 and 0 in that order.
        assert_eq!(mappings.items_in_section(0), Some(2));
        assert_eq!(mappings.index_for_row(0, 0), Some(1));
        assert_eq!(mappings.index_for_row(1, 0), Some(0));
        assert_eq!(mappings.row_for_index(0, "news"), Some(1));
        assert_eq!(mappings.row_for_index(4, "news"), None);
    }

    #[test]
    fn test_cell_dependencies_follow_display_order() {
        let (_dir, _db, _conn) = seed_db();
        let mut mappings = declared();
        mappings.add_cell_dependency("news", 1);
        mappings.add_cell_dependency("news", 2);
        mappings.add_cell_dependency("news", 0);
        assert_eq!(mappings.dependencies_for_group("news"), vec![1, 2]);

        mappings.set_reversed("news", true);
        assert_eq!(mappings.dependencies_for_group("news"), vec![-2, -1]);
        assert_eq!(mappings.dependencies_for_group("blog"), Vec::<i64>::new());
    }
}
