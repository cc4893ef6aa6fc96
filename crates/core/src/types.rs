//! Shared value types
//!
//! Small types used across the engine, store, and extension crates.

use serde::{Deserialize, Serialize};

/// Sentinel snapshot value meaning "never updated".
///
/// Used by mappings before their first `update_with_transaction` call.
pub const SNAPSHOT_UNSET: u64 = u64::MAX;

/// Graduated response to memory pressure.
///
/// Levels are cumulative: each level implies everything the previous level
/// releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushLevel {
    /// Drop transient hints (per-group edge heuristics and the like).
    Mild,
    /// Also drop row caches and prepared statements.
    Moderate,
    /// Also drop extension prepared state; it is rebuilt lazily on next use.
    Full,
}

/// Dynamically typed value for extension settings.
///
/// Extension settings live in a single backing table whose value column uses
/// the store's dynamic typing, so each row carries its own type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl SettingValue {
    /// Returns the integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload, if this is a `Real`.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            SettingValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text payload, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the blob payload, if this is a `Blob`.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SettingValue::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Real(v)
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Text(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SettingValue {
    fn from(v: Vec<u8>) -> Self {
        SettingValue::Blob(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_levels_are_ordered() {
        assert!(FlushLevel::Mild < FlushLevel::Moderate);
        assert!(FlushLevel::Moderate < FlushLevel::Full);
    }

    #[test]
    fn test_setting_value_accessors() {
        assert_eq!(SettingValue::Int(7).as_int(), Some(7));
        assert_eq!(SettingValue::Int(7).as_text(), None);
        assert_eq!(SettingValue::from("abc").as_text(), Some("abc"));
        assert_eq!(SettingValue::from(1.5).as_real(), Some(1.5));
        assert_eq!(
            SettingValue::from(vec![1u8, 2, 3]).as_blob(),
            Some(&[1u8, 2, 3][..])
        );
    }
}
