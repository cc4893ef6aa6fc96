//! Grouping and sorting rules
//!
//! A view is defined by two closures: grouping decides whether a row belongs
//! to the view and which group it lands in, sorting orders rows within a
//! group. Both come in four arities so the view knows which row parts a rule
//! actually reads; a mutation that cannot have changed any input a rule looks
//! at is resolved without fetching or comparing anything.

use std::cmp::Ordering;
use std::sync::Arc;

/// Grouping rule reading only the key.
pub type KeyGroupingFn = dyn Fn(&str) -> Option<String> + Send + Sync;
/// Grouping rule reading the key and the row data.
pub type DataGroupingFn = dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync;
/// Grouping rule reading the key and the row metadata.
pub type MetadataGroupingFn = dyn Fn(&str, Option<&[u8]>) -> Option<String> + Send + Sync;
/// Grouping rule reading the full row.
pub type RowGroupingFn = dyn Fn(&str, &[u8], Option<&[u8]>) -> Option<String> + Send + Sync;

/// Sorting rule comparing two rows by key. Receives the group first.
pub type KeySortingFn = dyn Fn(&str, &str, &str) -> Ordering + Send + Sync;
/// Sorting rule comparing two rows by key and data.
pub type DataSortingFn = dyn Fn(&str, &str, &[u8], &str, &[u8]) -> Ordering + Send + Sync;
/// Sorting rule comparing two rows by key and metadata.
pub type MetadataSortingFn =
    dyn Fn(&str, &str, Option<&[u8]>, &str, Option<&[u8]>) -> Ordering + Send + Sync;
/// Sorting rule comparing two full rows.
pub type RowSortingFn = dyn Fn(&str, &str, &[u8], Option<&[u8]>, &str, &[u8], Option<&[u8]>) -> Ordering
    + Send
    + Sync;

/// Decides view membership and group for each row.
///
/// Returning `None` excludes the row from the view. The variant tags which
/// row parts the rule reads, so the view can skip fetches the rule cannot
/// observe.
#[derive(Clone)]
pub enum Grouping {
    /// Group from the key alone.
    ByKey(Arc<KeyGroupingFn>),
    /// Group from the key and data.
    ByData(Arc<DataGroupingFn>),
    /// Group from the key and metadata.
    ByMetadata(Arc<MetadataGroupingFn>),
    /// Group from the full row.
    ByRow(Arc<RowGroupingFn>),
}

impl Grouping {
    /// Builds a key-only grouping rule.
    pub fn by_key<F>(f: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Grouping::ByKey(Arc::new(f))
    }

    /// Builds a grouping rule over key and data.
    pub fn by_data<F>(f: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Option<String> + Send + Sync + 'static,
    {
        Grouping::ByData(Arc::new(f))
    }

    /// Builds a grouping rule over key and metadata.
    pub fn by_metadata<F>(f: F) -> Self
    where
        F: Fn(&str, Option<&[u8]>) -> Option<String> + Send + Sync + 'static,
    {
        Grouping::ByMetadata(Arc::new(f))
    }

    /// Builds a grouping rule over the full row.
    pub fn by_row<F>(f: F) -> Self
    where
        F: Fn(&str, &[u8], Option<&[u8]>) -> Option<String> + Send + Sync + 'static,
    {
        Grouping::ByRow(Arc::new(f))
    }

    /// True when the rule reads row data.
    pub fn needs_data(&self) -> bool {
        matches!(self, Grouping::ByData(_) | Grouping::ByRow(_))
    }

    /// True when the rule reads row metadata.
    pub fn needs_metadata(&self) -> bool {
        matches!(self, Grouping::ByMetadata(_) | Grouping::ByRow(_))
    }

    /// Runs the rule. `data` may be `None` only when the variant does not
    /// read it; callers fetch what the arity demands first.
    pub(crate) fn group(
        &self,
        key: &str,
        data: Option<&[u8]>,
        metadata: Option<&[u8]>,
    ) -> Option<String> {
        match self {
            Grouping::ByKey(f) => f(key),
            Grouping::ByData(f) => f(key, require_data(data, key)),
            Grouping::ByMetadata(f) => f(key, metadata),
            Grouping::ByRow(f) => f(key, require_data(data, key), metadata),
        }
    }
}

impl std::fmt::Debug for Grouping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Grouping::ByKey(_) => "ByKey",
            Grouping::ByData(_) => "ByData",
            Grouping::ByMetadata(_) => "ByMetadata",
            Grouping::ByRow(_) => "ByRow",
        };
        f.debug_tuple("Grouping").field(&name).finish()
    }
}

/// One row as passed to a sorting rule. `data` is `None` when it was not
/// fetched because the rule's arity cannot read it.
#[derive(Clone, Copy)]
pub(crate) struct SortItem<'a> {
    pub(crate) key: &'a str,
    pub(crate) data: Option<&'a [u8]>,
    pub(crate) metadata: Option<&'a [u8]>,
}

/// Total order over the rows of one group.
///
/// Receives the group name plus both rows, with parts chosen by the variant's
/// arity. Must be a pure function of its inputs; the view persists the order
/// it produces.
#[derive(Clone)]
pub enum Sorting {
    /// Compare by key alone.
    ByKey(Arc<KeySortingFn>),
    /// Compare by key and data.
    ByData(Arc<DataSortingFn>),
    /// Compare by key and metadata.
    ByMetadata(Arc<MetadataSortingFn>),
    /// Compare full rows.
    ByRow(Arc<RowSortingFn>),
}

impl Sorting {
    /// Builds a key-only sorting rule.
    pub fn by_key<F>(f: F) -> Self
    where
        F: Fn(&str, &str, &str) -> Ordering + Send + Sync + 'static,
    {
        Sorting::ByKey(Arc::new(f))
    }

    /// Builds a sorting rule over keys and data.
    pub fn by_data<F>(f: F) -> Self
    where
        F: Fn(&str, &str, &[u8], &str, &[u8]) -> Ordering + Send + Sync + 'static,
    {
        Sorting::ByData(Arc::new(f))
    }

    /// Builds a sorting rule over keys and metadata.
    pub fn by_metadata<F>(f: F) -> Self
    where
        F: Fn(&str, &str, Option<&[u8]>, &str, Option<&[u8]>) -> Ordering + Send + Sync + 'static,
    {
        Sorting::ByMetadata(Arc::new(f))
    }

    /// Builds a sorting rule over full rows.
    pub fn by_row<F>(f: F) -> Self
    where
        F: Fn(&str, &str, &[u8], Option<&[u8]>, &str, &[u8], Option<&[u8]>) -> Ordering
            + Send
            + Sync
            + 'static,
    {
        Sorting::ByRow(Arc::new(f))
    }

    /// True when the rule reads row data.
    pub fn needs_data(&self) -> bool {
        matches!(self, Sorting::ByData(_) | Sorting::ByRow(_))
    }

    /// True when the rule reads row metadata.
    pub fn needs_metadata(&self) -> bool {
        matches!(self, Sorting::ByMetadata(_) | Sorting::ByRow(_))
    }

    /// Runs the comparison. Data slots may be `None` only when the variant
    /// does not read them.
    pub(crate) fn compare(&self, group: &str, a: SortItem<'_>, b: SortItem<'_>) -> Ordering {
        match self {
            Sorting::ByKey(f) => f(group, a.key, b.key),
            Sorting::ByData(f) => f(
                group,
                a.key,
                require_data(a.data, a.key),
                b.key,
                require_data(b.data, b.key),
            ),
            Sorting::ByMetadata(f) => f(group, a.key, a.metadata, b.key, b.metadata),
            Sorting::ByRow(f) => f(
                group,
                a.key,
                require_data(a.data, a.key),
                a.metadata,
                b.key,
                require_data(b.data, b.key),
                b.metadata,
            ),
        }
    }
}

impl std::fmt::Debug for Sorting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Sorting::ByKey(_) => "ByKey",
            Sorting::ByData(_) => "ByData",
            Sorting::ByMetadata(_) => "ByMetadata",
            Sorting::ByRow(_) => "ByRow",
        };
        f.debug_tuple("Sorting").field(&name).finish()
    }
}

fn require_data<'a>(data: Option<&'a [u8]>, key: &str) -> &'a [u8] {
    match data {
        Some(d) => d,
        None => panic!("view rule needs data for key '{key}' but none was fetched"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_arity_flags() {
        assert!(!Grouping::by_key(|_| None).needs_data());
        assert!(!Grouping::by_key(|_| None).needs_metadata());
        assert!(Grouping::by_data(|_, _| None).needs_data());
        assert!(Grouping::by_metadata(|_, _| None).needs_metadata());
        let by_row = Grouping::by_row(|_, _, _| None);
        assert!(by_row.needs_data() && by_row.needs_metadata());
    }

    #[test]
    fn test_sorting_arity_flags() {
        assert!(!Sorting::by_key(|_, a: &str, b: &str| a.cmp(b)).needs_data());
        assert!(Sorting::by_data(|_, _, a: &[u8], _, b: &[u8]| a.cmp(b)).needs_data());
        assert!(Sorting::by_metadata(|_, _, a, _, b| a.cmp(&b)).needs_metadata());
    }

    #[test]
    fn test_grouping_dispatch() {
        let rule = Grouping::by_data(|_, data| {
            std::str::from_utf8(data).ok().map(|s| s[..1].to_string())
        });
        assert_eq!(rule.group("k", Some(b"apple"), None), Some("a".to_string()));
        assert_eq!(Grouping::by_key(|_| None).group("k", None, None), None);
    }

    #[test]
    fn test_sorting_dispatch() {
        let rule = Sorting::by_key(|_, a, b| a.cmp(b));
        let left = SortItem {
            key: "a",
            data: None,
            metadata: None,
        };
        let right = SortItem {
            key: "b",
            data: None,
            metadata: None,
        };
        assert_eq!(rule.compare("g", left, right), Ordering::Less);
        assert_eq!(rule.compare("g", right, left), Ordering::Greater);
    }
}
