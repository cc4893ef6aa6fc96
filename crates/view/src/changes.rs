//! External view changesets
//!
//! Every commit that touched a view attaches a [`ViewChanges`] payload to its
//! commit notification. Consumers pull it by view name and replay the changes
//! against whatever mirrors the view (a list UI, usually).

use std::sync::Arc;

use vantage_core::CommitNotification;

/// One change to a view's ordering.
///
/// Indices are valid against the view state as it evolved inside the commit,
/// change by change: a `Delete` at 3 shifts what was at 4 down to 3 before
/// the next change is recorded. A row that changed groups appears as a
/// `Delete` in the old group followed by an `Insert` in the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    /// `key` entered `group` at `index`.
    Insert {
        /// Group the row landed in.
        group: String,
        /// Position it landed at.
        index: usize,
        /// Row key.
        key: String,
    },
    /// `key` left `group`; `index` is the position it held.
    Delete {
        /// Group the row left.
        group: String,
        /// Position it held when removed.
        index: usize,
        /// Row key.
        key: String,
    },
    /// `key` stayed in `group` but moved.
    Move {
        /// Group the row moved within.
        group: String,
        /// Position before the move.
        from: usize,
        /// Position after the move, in the post-removal ordering.
        to: usize,
        /// Row key.
        key: String,
    },
    /// `key` changed in place; its position held.
    Update {
        /// Group the row sits in.
        group: String,
        /// Position it still holds.
        index: usize,
        /// Row key.
        key: String,
    },
}

impl RowChange {
    /// The key this change concerns.
    pub fn key(&self) -> &str {
        match self {
            RowChange::Insert { key, .. }
            | RowChange::Delete { key, .. }
            | RowChange::Move { key, .. }
            | RowChange::Update { key, .. } => key,
        }
    }

    /// The group this change concerns.
    pub fn group(&self) -> &str {
        match self {
            RowChange::Insert { group, .. }
            | RowChange::Delete { group, .. }
            | RowChange::Move { group, .. }
            | RowChange::Update { group, .. } => group,
        }
    }
}

/// The per-commit change list published by one view.
#[derive(Debug, Clone, Default)]
pub struct ViewChanges {
    /// Changes in the order they happened. Empty when `reset` is set.
    pub changes: Vec<RowChange>,
    /// The view was rebuilt wholesale (registration populate or remove-all);
    /// per-row changes were not tracked and consumers should reload.
    pub reset: bool,
}

impl ViewChanges {
    /// Pulls the payload a view published into `notification`, if any.
    pub fn from_notification(
        notification: &CommitNotification,
        view_name: &str,
    ) -> Option<Arc<ViewChanges>> {
        let payload = notification.extension_payload(view_name)?;
        Arc::clone(payload).downcast::<ViewChanges>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_change_accessors() {
        let change = RowChange::Move {
            group: "g".to_string(),
            from: 2,
            to: 0,
            key: "k".to_string(),
        };
        assert_eq!(change.key(), "k");
        assert_eq!(change.group(), "g");
    }

    #[test]
    fn test_from_notification_downcasts() {
        let published = Arc::new(ViewChanges {
            changes: vec![RowChange::Insert {
                group: "g".to_string(),
                index: 0,
                key: "k".to_string(),
            }],
            reset: false,
        });
        let mut extensions: HashMap<String, vantage_core::ExtensionPayload> = HashMap::new();
        extensions.insert("order".to_string(), published);
        let notification = CommitNotification {
            snapshot: 1,
            connection_name: String::new(),
            data_changed: HashSet::new(),
            metadata_changed: HashSet::new(),
            removed_keys: HashSet::new(),
            all_keys_removed: false,
            extensions,
        };

        let pulled = ViewChanges::from_notification(&notification, "order").unwrap();
        assert_eq!(pulled.changes.len(), 1);
        assert!(ViewChanges::from_notification(&notification, "other").is_none());
    }
}
