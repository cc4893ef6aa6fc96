//! Engine configuration

use serde::{Deserialize, Serialize};
use vantage_store::StoreOptions;

/// Options for opening a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    /// Applied to every sqlite handle the database opens.
    #[serde(default)]
    pub store: StoreOptions,
    /// Defaults for connections opened without explicit options.
    #[serde(default)]
    pub connection: ConnectionOptions,
}

/// Options for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Name used in log lines and commit notifications. A sequential
    /// `connection-N` name is generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Row data cache capacity in entries. Zero means unbounded.
    #[serde(default = "default_object_cache_limit")]
    pub object_cache_limit: usize,
    /// Row metadata cache capacity in entries. Metadata tends to be small,
    /// so the default is more generous than the data cache. Zero means
    /// unbounded.
    #[serde(default = "default_metadata_cache_limit")]
    pub metadata_cache_limit: usize,
}

const fn default_object_cache_limit() -> usize {
    250
}

const fn default_metadata_cache_limit() -> usize {
    500
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            name: None,
            object_cache_limit: default_object_cache_limit(),
            metadata_cache_limit: default_metadata_cache_limit(),
        }
    }
}

impl ConnectionOptions {
    /// Returns options carrying `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectionOptions::default();
        assert!(opts.name.is_none());
        assert_eq!(opts.object_cache_limit, 250);
        assert_eq!(opts.metadata_cache_limit, 500);
    }

    #[test]
    fn test_named() {
        let opts = ConnectionOptions::named("ui");
        assert_eq!(opts.name.as_deref(), Some("ui"));
    }
}
