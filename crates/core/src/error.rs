//! Error types for the vantage engine
//!
//! Errors are split by how callers are expected to react:
//! - `Config` errors are API misuse detectable at call time; they are always
//!   returned as values and never panic.
//! - `Storage` errors are backing-store failures; the engine logs them with
//!   context and surfaces them as failures.
//! - Consistency violations (a connection that cannot be caught up, a corrupt
//!   view page chain) are not represented here at all; the engine treats them
//!   as fatal and panics at the detection site.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.

use thiserror::Error;

/// Result type alias for vantage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the vantage engine
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or API misuse detectable at call time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing-store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Extension-scoped failure
    #[error("Extension {name:?} error: {message}")]
    Extension {
        /// Registered name of the failing extension
        name: String,
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Builds a `Config` error from anything displayable.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Builds a `Storage` error from anything displayable.
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(message.into())
    }

    /// Builds an `Extension` error scoped to a registered name.
    pub fn extension(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Extension {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Error::config("extension name may not be empty");
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("may not be empty"));
    }

    #[test]
    fn test_error_display_storage() {
        let err = Error::storage("disk I/O error");
        let msg = err.to_string();
        assert!(msg.contains("Storage error"));
        assert!(msg.contains("disk I/O error"));
    }

    #[test]
    fn test_error_display_serialization() {
        let err = Error::Serialization("invalid page blob".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Serialization error"));
        assert!(msg.contains("invalid page blob"));
    }

    #[test]
    fn test_error_display_extension() {
        let err = Error::extension("order", "unsupported store");
        let msg = err.to_string();
        assert!(msg.contains("order"));
        assert!(msg.contains("unsupported store"));
    }
}
