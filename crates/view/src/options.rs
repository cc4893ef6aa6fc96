//! View configuration

use serde::{Deserialize, Serialize};

/// Options fixed at view construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewOptions {
    /// Keys per index page before the page splits.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// When false the index is dropped and rebuilt at every registration
    /// instead of surviving restarts, and the version marker is ignored.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// Version marker persisted in the view's settings. Registering with a
    /// different value drops and repopulates the index; bump it whenever the
    /// grouping or sorting rules change meaning.
    #[serde(default)]
    pub version: i64,
}

const fn default_max_page_size() -> usize {
    50
}

const fn default_persistent() -> bool {
    true
}

impl ViewOptions {
    /// Effective page size limit. A configured zero would split forever.
    pub(crate) fn page_limit(&self) -> usize {
        self.max_page_size.max(1)
    }
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            persistent: default_persistent(),
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ViewOptions::default();
        assert_eq!(opts.max_page_size, 50);
        assert!(opts.persistent);
        assert_eq!(opts.version, 0);
    }

    #[test]
    fn test_page_limit_floors_at_one() {
        let mut opts = ViewOptions::default();
        opts.max_page_size = 0;
        assert_eq!(opts.page_limit(), 1);
    }
}
