//! Extension framework.
//!
//! Extensions maintain derived state (secondary indexes, orderings) alongside
//! the primary rows, kept in sync by hooking into every mutation. The
//! protocol mirrors the engine's own three levels:
//!
//! - [`Extension`]: one shared, stateless descriptor per registration.
//! - [`ExtensionConnection`]: per-connection state (caches), owned by the
//!   connection worker.
//! - [`ExtensionTransaction`]: per-transaction state, receives row hooks and
//!   produces changesets at commit.
//!
//! A transaction-level instance is created from the connection-level state
//! when a transaction begins and folds back into it on commit or rollback,
//! which is how an extension's caches stay coherent with the snapshot its
//! connection sits on.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use vantage_core::{ExtensionPayload, FlushLevel, Result, SettingValue};
use vantage_store::Store;

use crate::connection::CoreState;

// ============================================================================
// Traits
// ============================================================================

/// Database-level extension descriptor.
///
/// Shared by every connection; must not hold mutable state. Registered under
/// a name via [`Database::register_extension`](crate::Database::register_extension).
pub trait Extension: Send + Sync {
    /// Stable identifier for the extension's kind, persisted so a reopened
    /// database can tell which class previously owned leftover tables.
    fn class_name(&self) -> &'static str;

    /// The tables this extension would own when registered under `name`.
    /// Recorded at registration and used to drop them at unregistration.
    fn table_names(&self, name: &str) -> Vec<String>;

    /// Whether the extension can run against the store as configured.
    fn supports_store(&self) -> bool {
        true
    }

    /// Creates the per-connection state for one connection.
    fn new_connection_state(&self, name: &str) -> Box<dyn ExtensionConnection>;
}

/// Per-connection extension state.
pub trait ExtensionConnection: Send {
    /// Consumes the connection state to begin a transaction-level instance.
    fn begin(self: Box<Self>, read_write: bool) -> Box<dyn ExtensionTransaction>;

    /// Patches in-memory state with the extension's portion of a sibling
    /// connection's committed changeset. Runs between transactions.
    fn apply_changeset(&mut self, payload: &ExtensionPayload);

    /// Releases memory. `Mild` trims what is cheap to rebuild, `Full` drops
    /// everything reloadable.
    fn flush(&mut self, level: FlushLevel);
}

/// Outcome of an extension's commit, harvested before the sqlite commit.
#[derive(Default)]
pub struct ExtensionChangeset {
    /// Fanned out to sibling connections so they can patch their own
    /// extension state. `None` when nothing changed.
    pub internal: Option<ExtensionPayload>,
    /// Attached to the commit notification for API consumers.
    pub external: Option<ExtensionPayload>,
    /// True when the extension wrote to its tables this transaction.
    pub has_disk_changes: bool,
}

/// Per-transaction extension state. Receives row hooks in mutation order.
///
/// Hooks default to no-ops so an extension only implements the ones it needs.
/// A hook returning an error aborts the enclosing write transaction.
#[allow(unused_variables)]
pub trait ExtensionTransaction: Send {
    /// First-transaction setup: create tables and populate from existing
    /// rows. Called once, inside the registering write transaction.
    fn create_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Per-transaction setup: load any persistent structures not already
    /// cached on the connection. Called after every begin.
    fn prepare_if_needed(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A row was inserted.
    fn on_insert(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        rowid: i64,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        Ok(())
    }

    /// An existing row's data (and metadata) was replaced.
    fn on_update(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        rowid: i64,
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        Ok(())
    }

    /// An existing row's metadata was replaced, data untouched.
    fn on_update_metadata_only(
        &mut self,
        ctx: &mut ExtContext<'_>,
        key: &str,
        rowid: i64,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        Ok(())
    }

    /// A row was touched: flagged as changed without new values.
    fn on_touch(&mut self, ctx: &mut ExtContext<'_>, key: &str, rowid: i64) -> Result<()> {
        Ok(())
    }

    /// A row was removed.
    fn on_remove(&mut self, ctx: &mut ExtContext<'_>, key: &str, rowid: i64) -> Result<()> {
        Ok(())
    }

    /// Several rows were removed in one operation.
    fn on_remove_many(&mut self, ctx: &mut ExtContext<'_>, rows: &[(String, i64)]) -> Result<()> {
        Ok(())
    }

    /// Every row was removed.
    fn on_remove_all(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Last chance to write to the extension's tables, called right before
    /// the sqlite commit.
    fn pre_commit(&mut self, ctx: &mut ExtContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Harvests the changeset after `pre_commit`, before the sqlite commit.
    fn changeset(&mut self) -> ExtensionChangeset {
        ExtensionChangeset::default()
    }

    /// Folds transaction state back into connection state after a commit.
    fn commit(self: Box<Self>) -> Box<dyn ExtensionConnection>;

    /// Discards transaction state after a rollback. Implementations must
    /// also drop connection-level caches the transaction may have polluted.
    fn rollback(self: Box<Self>) -> Box<dyn ExtensionConnection>;

    /// Downcast support for typed query surfaces built on top of
    /// [`ReadTransaction::with_extension`](crate::ReadTransaction::with_extension).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ============================================================================
// Hook context
// ============================================================================

/// Engine services available to extension hooks.
///
/// Grants cache-assisted row reads, raw store access for the extension's own
/// tables, and persistent settings scoped to the extension's registered name.
pub struct ExtContext<'a> {
    pub(crate) core: &'a mut CoreState,
    pub(crate) name: &'a str,
    pub(crate) read_write: bool,
}

impl<'a> ExtContext<'a> {
    /// The name the extension was registered under.
    pub fn registered_name(&self) -> &str {
        self.name
    }

    /// True inside a write transaction.
    pub fn read_write(&self) -> bool {
        self.read_write
    }

    /// Reads a row's data, through the connection caches.
    pub fn get_data(&mut self, key: &str) -> Result<Option<Arc<[u8]>>> {
        self.core.get_data(key)
    }

    /// Reads a row's metadata, through the connection caches. Outer `None`
    /// means the row does not exist.
    pub fn get_metadata(&mut self, key: &str) -> Result<Option<Option<Arc<[u8]>>>> {
        self.core.get_metadata(key)
    }

    /// Reads a full row, through the connection caches.
    pub fn get_row(&mut self, key: &str) -> Result<Option<(Arc<[u8]>, Option<Arc<[u8]>>)>> {
        self.core.get_row(key)
    }

    /// Raw store access, for SQL against the extension's own tables.
    pub fn store(&self) -> &Store {
        &self.core.store
    }

    /// Reads one of the extension's persistent settings.
    pub fn get_setting(&self, key: &str) -> Result<Option<SettingValue>> {
        Ok(self.core.store.ext_get(self.name, key)?)
    }

    /// Writes one of the extension's persistent settings.
    pub fn set_setting(&self, key: &str, value: &SettingValue) -> Result<()> {
        Ok(self.core.store.ext_set(self.name, key, value)?)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Settings key under which an extension's class name is persisted.
pub(crate) const SETTING_CLASS: &str = "class";
/// Settings key under which an extension's table list is persisted, comma
/// joined. Read back at unregistration so tables of an extension that is not
/// even loaded can still be dropped.
pub(crate) const SETTING_TABLES: &str = "tables";

/// One registered extension as the whole database sees it.
pub(crate) struct RegisteredExtension {
    pub(crate) name: String,
    pub(crate) ext: Arc<dyn Extension>,
}

impl Clone for RegisteredExtension {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            ext: Arc::clone(&self.ext),
        }
    }
}

/// The set of registered extensions at one snapshot. Travels inside
/// changesets as an opaque payload so lagging connections can sync their
/// slots before applying the rest of the changeset.
pub(crate) type ExtensionRegistry = Vec<RegisteredExtension>;

pub(crate) fn registry_payload(registry: &Arc<ExtensionRegistry>) -> ExtensionPayload {
    Arc::clone(registry) as ExtensionPayload
}

pub(crate) fn registry_from_payload(payload: &ExtensionPayload) -> Option<Arc<ExtensionRegistry>> {
    Arc::clone(payload).downcast::<ExtensionRegistry>().ok()
}

/// Typed token returned by registration, naming an extension of a known
/// concrete type. Carries no state besides the name.
pub struct ExtensionHandle<E> {
    name: String,
    _marker: PhantomData<fn() -> E>,
}

impl<E> ExtensionHandle<E> {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The name the extension was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<E> Clone for ExtensionHandle<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> fmt::Debug for ExtensionHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Validates a registration name: non-empty, `[A-Za-z0-9_]` only. Names feed
/// into table names, so anything fancier would need quoting everywhere.
pub(crate) fn validate_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_extension_name() {
        assert!(validate_extension_name("order"));
        assert!(validate_extension_name("by_date_2"));
        assert!(!validate_extension_name(""));
        assert!(!validate_extension_name("bad-name"));
        assert!(!validate_extension_name("bad name"));
        assert!(!validate_extension_name("bad\"quote"));
    }

    #[test]
    fn test_registry_payload_roundtrip() {
        let registry: Arc<ExtensionRegistry> = Arc::new(Vec::new());
        let payload = registry_payload(&registry);
        let back = registry_from_payload(&payload).unwrap();
        assert!(back.is_empty());
        assert_eq!(Arc::strong_count(&registry), 3);
    }
}
