//! Section and row projections over a view
//!
//! [`Mappings`] freeze one transaction's picture of a view into the shape a
//! sectioned list UI wants: visible groups become sections, group positions
//! become rows, and per-group options (ranges, reversal, cell dependencies)
//! are applied consistently in both directions.
//!
//! The struct is plain data after [`Mappings::update_with_transaction`]; it
//! can be moved across threads and queried without touching the database.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use vantage_core::{Result, SNAPSHOT_UNSET};
use vantage_engine::ReadTransaction;

use crate::handle::ViewAccess;

/// Which end of a group a range window sticks to as rows come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePin {
    /// The window holds its distance from the first row.
    Beginning,
    /// The window holds its distance from the last row.
    End,
}

impl RangePin {
    fn flipped(self) -> Self {
        match self {
            RangePin::Beginning => RangePin::End,
            RangePin::End => RangePin::Beginning,
        }
    }
}

/// Limits how much of a group a section shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRange {
    /// Shows at most `length` rows, `offset` rows in from the pinned end.
    Fixed {
        /// Window size cap.
        length: usize,
        /// Rows skipped between the pinned end and the window.
        offset: usize,
        /// End the window is anchored to.
        pin: RangePin,
    },
    /// Shows whatever fits between `min_length` and `max_length`.
    Flexible {
        /// Lower bound, clamped to what exists.
        min_length: usize,
        /// Upper bound.
        max_length: usize,
        /// Rows skipped between the pinned end and the window.
        offset: usize,
        /// End the window is anchored to.
        pin: RangePin,
    },
}

impl ViewRange {
    /// A fixed window at the pinned end.
    pub fn fixed(length: usize, pin: RangePin) -> Self {
        ViewRange::Fixed {
            length,
            offset: 0,
            pin,
        }
    }

    /// A fixed window `offset` rows in from the pinned end.
    pub fn fixed_with_offset(length: usize, offset: usize, pin: RangePin) -> Self {
        ViewRange::Fixed {
            length,
            offset,
            pin,
        }
    }

    /// A growing window at the pinned end, capped at `max_length`.
    pub fn flexible(max_length: usize, pin: RangePin) -> Self {
        ViewRange::Flexible {
            min_length: 0,
            max_length,
            offset: 0,
            pin,
        }
    }

    /// A growing window with explicit bounds and offset.
    pub fn flexible_with_bounds(
        min_length: usize,
        max_length: usize,
        offset: usize,
        pin: RangePin,
    ) -> Self {
        ViewRange::Flexible {
            min_length,
            max_length,
            offset,
            pin,
        }
    }

    /// The window over a group of `count` rows as `(start, length)` in
    /// global indices. A reversed group anchors to the opposite end, so the
    /// pin keeps meaning "this end of the displayed order".
    fn window(&self, count: usize, reversed: bool) -> (usize, usize) {
        let (offset, pin, length) = match *self {
            ViewRange::Fixed {
                length,
                offset,
                pin,
            } => {
                let avail = count.saturating_sub(offset);
                (offset, pin, length.min(avail))
            }
            ViewRange::Flexible {
                min_length,
                max_length,
                offset,
                pin,
            } => {
                let avail = count.saturating_sub(offset);
                (offset, pin, avail.min(max_length).max(min_length).min(avail))
            }
        };
        let pin = if reversed { pin.flipped() } else { pin };
        let start = match pin {
            RangePin::Beginning => offset,
            RangePin::End => count.saturating_sub(offset).saturating_sub(length),
        };
        (start, length)
    }
}

/// A UI-shaped snapshot of a view: sections, rows, and the arithmetic
/// between them.
///
/// Construct once, configure, then refresh with
/// [`update_with_transaction`](Mappings::update_with_transaction) inside
/// every transaction whose data the UI is about to show. All projections
/// answer from the refreshed state, so they stay coherent with each other
/// even while the database moves on.
#[derive(Clone)]
pub struct Mappings {
    view_name: String,
    /// Declared groups in section order; empty in dynamic mode.
    all_groups: Vec<String>,
    dynamic_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    dynamic_sort: Option<Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>>,
    /// Declared groups that drop out of the section list while empty.
    dynamic_groups: HashSet<String>,
    visible: Vec<String>,
    /// Full per-group counts as of the last update.
    counts: HashMap<String, usize>,
    ranges: HashMap<String, ViewRange>,
    reversed: HashSet<String>,
    dependencies: HashMap<String, HashSet<i64>>,
    snapshot: u64,
}

impl Mappings {
    /// Mappings over a fixed, ordered set of groups. Every group is its own
    /// section, present even while empty until marked dynamic.
    pub fn new(view_name: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            view_name: view_name.into(),
            all_groups: groups,
            dynamic_filter: None,
            dynamic_sort: None,
            dynamic_groups: HashSet::new(),
            visible: Vec::new(),
            counts: HashMap::new(),
            ranges: HashMap::new(),
            reversed: HashSet::new(),
            dependencies: HashMap::new(),
            snapshot: SNAPSHOT_UNSET,
        }
    }

    /// Mappings that discover their groups from the view on every update,
    /// keeping those the filter accepts in the sort's order.
    pub fn dynamic<F, S>(view_name: impl Into<String>, filter: F, sort: S) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
        S: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        let mut mappings = Self::new(view_name, Vec::new());
        mappings.dynamic_filter = Some(Arc::new(filter));
        mappings.dynamic_sort = Some(Arc::new(sort));
        mappings
    }

    /// The view these mappings project.
    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Marks a declared group as dynamic: its section disappears while the
    /// group is empty. Takes effect at the next update.
    pub fn set_group_dynamic(&mut self, group: &str, dynamic: bool) {
        if dynamic {
            self.dynamic_groups.insert(group.to_string());
        } else {
            self.dynamic_groups.remove(group);
        }
    }

    /// Marks every declared group dynamic, or none of them.
    pub fn set_all_groups_dynamic(&mut self, dynamic: bool) {
        if dynamic {
            self.dynamic_groups = self.all_groups.iter().cloned().collect();
        } else {
            self.dynamic_groups.clear();
        }
    }

    /// Restricts a group's section to a window of the group.
    pub fn set_range(&mut self, group: &str, range: ViewRange) {
        self.ranges.insert(group.to_string(), range);
    }

    /// Shows the whole group again.
    pub fn remove_range(&mut self, group: &str) {
        self.ranges.remove(group);
    }

    /// The range currently limiting a group, if any.
    pub fn range_for_group(&self, group: &str) -> Option<ViewRange> {
        self.ranges.get(group).copied()
    }

    /// Displays a group last-to-first. Rows, pins, and dependency offsets
    /// all follow the displayed order.
    pub fn set_reversed(&mut self, group: &str, reversed: bool) {
        if reversed {
            self.reversed.insert(group.to_string());
        } else {
            self.reversed.remove(group);
        }
    }

    /// True when the group displays last-to-first.
    pub fn is_reversed(&self, group: &str) -> bool {
        self.reversed.contains(group)
    }

    /// Declares that drawing a row also reads the row `offset` places away
    /// in display order, so consumers know to refresh neighbors. Offset zero
    /// is meaningless and ignored.
    pub fn add_cell_dependency(&mut self, group: &str, offset: i64) {
        if offset != 0 {
            self.dependencies
                .entry(group.to_string())
                .or_default()
                .insert(offset);
        }
    }

    /// Dependency offsets for a group in display order: reversal negates
    /// them. Sorted for a stable answer.
    pub fn dependencies_for_group(&self, group: &str) -> Vec<i64> {
        let Some(offsets) = self.dependencies.get(group) else {
            return Vec::new();
        };
        let reversed = self.reversed.contains(group);
        let mut offsets: Vec<i64> = offsets
            .iter()
            .map(|&offset| if reversed { -offset } else { offset })
            .collect();
        offsets.sort_unstable();
        offsets
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Re-reads group counts and visibility from the view inside `txn`,
    /// stamping these mappings with the transaction's snapshot.
    pub fn update_with_transaction(&mut self, txn: &mut ReadTransaction<'_>) -> Result<()> {
        let snapshot = txn.snapshot();
        let mut handle = txn.view(&self.view_name)?;
        let mut counts = HashMap::new();
        let visible = if let Some(filter) = &self.dynamic_filter {
            let mut groups = Vec::new();
            for group in handle.groups()? {
                if filter(&group) {
                    counts.insert(group.clone(), handle.len(&group)?);
                    groups.push(group);
                }
            }
            if let Some(sort) = &self.dynamic_sort {
                groups.sort_by(|a, b| sort(a, b));
            }
            groups
        } else {
            let mut groups = Vec::new();
            for group in &self.all_groups {
                let len = handle.len(group)?;
                counts.insert(group.clone(), len);
                if len > 0 || !self.dynamic_groups.contains(group) {
                    groups.push(group.clone());
                }
            }
            groups
        };
        self.counts = counts;
        self.visible = visible;
        self.snapshot = snapshot;
        Ok(())
    }

    /// Snapshot of the transaction last used to update, or
    /// [`SNAPSHOT_UNSET`] before the first update.
    pub fn snapshot_of_last_update(&self) -> u64 {
        self.snapshot
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    /// Number of visible sections.
    pub fn section_count(&self) -> usize {
        self.visible.len()
    }

    /// The group behind a section.
    pub fn group_for_section(&self, section: usize) -> Option<&str> {
        self.visible.get(section).map(|group| group.as_str())
    }

    /// The section a group occupies, if visible.
    pub fn section_for_group(&self, group: &str) -> Option<usize> {
        self.visible.iter().position(|candidate| candidate == group)
    }

    /// Visible groups in section order.
    pub fn visible_groups(&self) -> &[String] {
        &self.visible
    }

    /// True when the group currently has a section.
    pub fn is_group_visible(&self, group: &str) -> bool {
        self.visible.iter().any(|candidate| candidate == group)
    }

    /// Rows shown in a section, after any range windowing.
    pub fn items_in_section(&self, section: usize) -> Option<usize> {
        let group = self.group_for_section(section)?;
        Some(self.visible_count_for_group(group))
    }

    /// Rows shown for a group, after any range windowing.
    pub fn visible_count_for_group(&self, group: &str) -> usize {
        match self.counts.get(group) {
            Some(&count) => self.window_for(group, count).1,
            None => 0,
        }
    }

    /// Full group size as of the last update, ignoring ranges.
    pub fn full_count_for_group(&self, group: &str) -> usize {
        self.counts.get(group).copied().unwrap_or(0)
    }

    /// Maps a display row in a section to the group's global index.
    pub fn index_for_row(&self, row: usize, section: usize) -> Option<usize> {
        let group = self.group_for_section(section)?;
        self.index_for_row_in_group(row, group)
    }

    /// Maps a display row to the group's global index, honoring the group's
    /// range window and reversal.
    pub fn index_for_row_in_group(&self, row: usize, group: &str) -> Option<usize> {
        let count = *self.counts.get(group)?;
        let (start, length) = self.window_for(group, count);
        if row >= length {
            return None;
        }
        if self.reversed.contains(group) {
            Some(start + (length - 1 - row))
        } else {
            Some(start + row)
        }
    }

    /// Maps a group's global index back to its display row, if the index is
    /// inside the window.
    pub fn row_for_index(&self, index: usize, group: &str) -> Option<usize> {
        let count = *self.counts.get(group)?;
        let (start, length) = self.window_for(group, count);
        if index < start || index >= start + length {
            return None;
        }
        let row = index - start;
        if self.reversed.contains(group) {
            Some(length - 1 - row)
        } else {
            Some(row)
        }
    }

    fn window_for(&self, group: &str, count: usize) -> (usize, usize) {
        let reversed = self.reversed.contains(group);
        match self.ranges.get(group) {
            Some(range) => range.window(count, reversed),
            None => (0, count),
        }
    }
}

impl fmt::Debug for Mappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mappings")
            .field("view_name", &self.view_name)
            .field("visible", &self.visible)
            .field("counts", &self.counts)
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: usize) -> Mappings {
        let mut mappings = Mappings::new("order", vec!["all".to_string()]);
        mappings.counts.insert("all".to_string(), count);
        mappings.visible = vec!["all".to_string()];
        mappings
    }

    #[test]
    fn test_unconfigured_mappings_are_identity() {
        let mappings = seeded(10);
        assert_eq!(mappings.snapshot_of_last_update(), SNAPSHOT_UNSET);
        assert_eq!(mappings.section_count(), 1);
        assert_eq!(mappings.group_for_section(0), Some("all"));
        assert_eq!(mappings.section_for_group("all"), Some(0));
        assert_eq!(mappings.items_in_section(0), Some(10));
        assert_eq!(mappings.full_count_for_group("all"), 10);
        assert_eq!(mappings.index_for_row(3, 0), Some(3));
        assert_eq!(mappings.row_for_index(3, "all"), Some(3));
        assert_eq!(mappings.index_for_row_in_group(10, "all"), None);
        assert_eq!(mappings.row_for_index(0, "missing"), None);
    }

    #[test]
    fn test_fixed_range_pinned_to_end() {
        let mut mappings = seeded(100);
        mappings.set_range("all", ViewRange::fixed(20, RangePin::End));
        assert_eq!(mappings.visible_count_for_group("all"), 20);
        assert_eq!(mappings.index_for_row_in_group(0, "all"), Some(80));
        assert_eq!(mappings.index_for_row_in_group(19, "all"), Some(99));
        assert_eq!(mappings.row_for_index(85, "all"), Some(5));
        assert_eq!(mappings.row_for_index(79, "all"), None);
        assert_eq!(mappings.full_count_for_group("all"), 100);
    }

    #[test]
    fn test_fixed_range_clamps_to_what_exists() {
        let mut mappings = seeded(8);
        mappings.set_range(
            "all",
            ViewRange::fixed_with_offset(10, 5, RangePin::Beginning),
        );
        assert_eq!(mappings.visible_count_for_group("all"), 3);
        assert_eq!(mappings.index_for_row_in_group(0, "all"), Some(5));
        assert_eq!(mappings.index_for_row_in_group(2, "all"), Some(7));
        assert_eq!(mappings.index_for_row_in_group(3, "all"), None);
    }

    #[test]
    fn test_flexible_range_grows_to_its_cap() {
        let mut mappings = seeded(30);
        mappings.set_range(
            "all",
            ViewRange::flexible_with_bounds(0, 50, 10, RangePin::End),
        );
        // 20 rows fit under the cap once the offset is taken off the end.
        assert_eq!(mappings.visible_count_for_group("all"), 20);
        assert_eq!(mappings.index_for_row_in_group(0, "all"), Some(0));
        assert_eq!(mappings.index_for_row_in_group(19, "all"), Some(19));

        let mut capped = seeded(200);
        capped.set_range("all", ViewRange::flexible(50, RangePin::End));
        assert_eq!(capped.visible_count_for_group("all"), 50);
        assert_eq!(capped.index_for_row_in_group(0, "all"), Some(150));
    }

    #[test]
    fn test_reversal_mirrors_rows() {
        let mut mappings = seeded(10);
        mappings.set_reversed("all", true);
        assert_eq!(mappings.index_for_row_in_group(0, "all"), Some(9));
        assert_eq!(mappings.index_for_row_in_group(9, "all"), Some(0));
        assert_eq!(mappings.row_for_index(9, "all"), Some(0));
        assert_eq!(mappings.row_for_index(0, "all"), Some(9));
    }

    #[test]
    fn test_reversal_flips_the_pin() {
        let mut mappings = seeded(10);
        mappings.set_range("all", ViewRange::fixed(5, RangePin::Beginning));
        mappings.set_reversed("all", true);
        // Pinned to the beginning of the displayed order, which is the tail
        // of the underlying order.
        assert_eq!(mappings.visible_count_for_group("all"), 5);
        assert_eq!(mappings.index_for_row_in_group(0, "all"), Some(9));
        assert_eq!(mappings.index_for_row_in_group(4, "all"), Some(5));
        assert_eq!(mappings.row_for_index(4, "all"), None);
    }

    #[test]
    fn test_dependencies_negate_under_reversal() {
        let mut mappings = seeded(10);
        mappings.add_cell_dependency("all", -1);
        mappings.add_cell_dependency("all", 2);
        mappings.add_cell_dependency("all", 0);
        assert_eq!(mappings.dependencies_for_group("all"), vec![-1, 2]);
        mappings.set_reversed("all", true);
        assert_eq!(mappings.dependencies_for_group("all"), vec![-2, 1]);
        assert_eq!(mappings.dependencies_for_group("other"), Vec::<i64>::new());
    }

    #[test]
    fn test_empty_group_shows_no_rows() {
        let mappings = seeded(0);
        assert_eq!(mappings.items_in_section(0), Some(0));
        assert_eq!(mappings.index_for_row_in_group(0, "all"), None);
    }
}
