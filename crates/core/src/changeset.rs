//! Changeset types
//!
//! Every committed write transaction that changed something produces one
//! changeset, in two forms:
//!
//! - [`InternalChangeset`]: the rich form fanned out to sibling connections.
//!   Carries the changed values themselves (shared, not copied) so siblings can
//!   patch their row caches in place without touching the store.
//! - [`CommitNotification`]: the immutable value-set form delivered to commit
//!   observers. Carries key sets only, never values.
//!
//! A key may legitimately appear in both a change map and the removed set of
//! the same changeset (set followed by remove inside one transaction). Every
//! applier treats removal as taking precedence.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Opaque per-extension changeset payload.
///
/// Extensions publish whatever structure they need; appliers downcast.
pub type ExtensionPayload = Arc<dyn Any + Send + Sync>;

/// Rich changeset form, applied to sibling connections during fan-out.
#[derive(Clone)]
pub struct InternalChangeset {
    /// Snapshot number this changeset produced.
    pub snapshot: u64,
    /// Keys whose data changed, with the new data.
    pub object_changes: HashMap<String, Arc<[u8]>>,
    /// Keys whose metadata changed, with the new metadata (`None` = cleared).
    pub metadata_changes: HashMap<String, Option<Arc<[u8]>>>,
    /// Keys removed. Takes precedence over entries in the change maps.
    pub removed_keys: HashSet<String>,
    /// The whole store was emptied. Cache patching stops at a full clear.
    pub all_keys_removed: bool,
    /// Per-extension internal payloads, keyed by registered name.
    pub extensions: HashMap<String, ExtensionPayload>,
    /// Replacement extension registry, present when this commit registered or
    /// unregistered an extension. Opaque here; the engine downcasts.
    pub extensions_changed: Option<ExtensionPayload>,
}

impl std::fmt::Debug for InternalChangeset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalChangeset")
            .field("snapshot", &self.snapshot)
            .field("object_changes", &self.object_changes.len())
            .field("metadata_changes", &self.metadata_changes.len())
            .field("removed_keys", &self.removed_keys.len())
            .field("all_keys_removed", &self.all_keys_removed)
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .field("extensions_changed", &self.extensions_changed.is_some())
            .finish()
    }
}

/// Immutable value-set changeset form, delivered to commit observers.
pub struct CommitNotification {
    /// Snapshot number the commit produced.
    pub snapshot: u64,
    /// Name of the connection that committed (empty if unnamed).
    pub connection_name: String,
    /// Keys whose data changed (including touched keys).
    pub data_changed: HashSet<String>,
    /// Keys whose metadata changed.
    pub metadata_changed: HashSet<String>,
    /// Keys removed. Takes precedence over the change sets.
    pub removed_keys: HashSet<String>,
    /// The whole store was emptied.
    pub all_keys_removed: bool,
    /// Per-extension external payloads, keyed by registered name.
    pub extensions: HashMap<String, ExtensionPayload>,
}

impl CommitNotification {
    /// True if the commit may have affected `key` in any way.
    pub fn has_change_for_key(&self, key: &str) -> bool {
        self.all_keys_removed
            || self.removed_keys.contains(key)
            || self.data_changed.contains(key)
            || self.metadata_changed.contains(key)
    }

    /// True if the commit may have affected any of `keys`.
    pub fn has_change_for_any_keys<'a, I>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().any(|k| self.has_change_for_key(k))
    }

    /// True if the commit removed `key` (individually or via remove-all).
    pub fn was_key_removed(&self, key: &str) -> bool {
        self.all_keys_removed || self.removed_keys.contains(key)
    }

    /// Extension payload published under `name`, if any.
    pub fn extension_payload(&self, name: &str) -> Option<&ExtensionPayload> {
        self.extensions.get(name)
    }
}

impl std::fmt::Debug for CommitNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitNotification")
            .field("snapshot", &self.snapshot)
            .field("connection_name", &self.connection_name)
            .field("data_changed", &self.data_changed.len())
            .field("metadata_changed", &self.metadata_changed.len())
            .field("removed_keys", &self.removed_keys.len())
            .field("all_keys_removed", &self.all_keys_removed)
            .finish()
    }
}

/// True if any notification in `batch` may have affected `key`.
///
/// Consumers that accumulate notifications (long-lived reads) use these batch
/// predicates to decide whether cached derived state is stale.
pub fn has_change_for_key(batch: &[Arc<CommitNotification>], key: &str) -> bool {
    batch.iter().any(|n| n.has_change_for_key(key))
}

/// True if any notification in `batch` may have affected any of `keys`.
pub fn has_change_for_any_keys(batch: &[Arc<CommitNotification>], keys: &[&str]) -> bool {
    batch.iter().any(|n| n.has_change_for_any_keys(keys.iter().copied()))
}
