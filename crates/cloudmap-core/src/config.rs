//! Mapping configuration.
//!
//! [`MappingConfig`] captures how a mapping behaves on creation and on
//! reads of unknown keys. It is plain serde data, so it can be loaded from
//! JSON alongside the storage URI it is used with.

use serde::{Deserialize, Serialize};

use crate::error::CloudMapError;
use crate::Result;

/// Behaviour switches for a [`CloudMapping`](crate::CloudMapping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// List the backend on creation if the container already existed.
    pub sync_initially: bool,

    /// Bypass the etag cache for `get` and `contains`, always querying the
    /// backend for the latest value.
    pub read_blindly: bool,

    /// In blind-read mode, fail with `NotFound` when no remote value
    /// exists instead of returning the default value.
    pub read_blindly_error: bool,

    /// Prepended to every key, scoping the mapping to a sub-namespace.
    pub key_prefix: Option<String>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            sync_initially: true,
            read_blindly: false,
            read_blindly_error: false,
            key_prefix: None,
        }
    }
}

impl MappingConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CloudMapError::Config {
            message: format!("Invalid mapping configuration: {e}"),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_sync_initially(mut self, sync: bool) -> Self {
        self.sync_initially = sync;
        self
    }

    pub fn with_read_blindly(mut self, read_blindly: bool) -> Self {
        self.read_blindly = read_blindly;
        self
    }

    pub fn with_read_blindly_error(mut self, error: bool) -> Self {
        self.read_blindly_error = error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MappingConfig::default();
        assert!(config.sync_initially);
        assert!(!config.read_blindly);
        assert!(!config.read_blindly_error);
        assert_eq!(config.key_prefix, None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = MappingConfig::from_json(r#"{"read_blindly": true, "key_prefix": "tests/"}"#)
            .unwrap();
        assert!(config.sync_initially);
        assert!(config.read_blindly);
        assert_eq!(config.key_prefix.as_deref(), Some("tests/"));
    }

    #[test]
    fn test_from_json_invalid() {
        let err = MappingConfig::from_json("{\"sync_initially\": 3}").unwrap_err();
        assert!(matches!(err, CloudMapError::Config { .. }));
    }

    #[test]
    fn test_config_serialization() {
        let config = MappingConfig::default()
            .with_key_prefix("p/")
            .with_sync_initially(false);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized = MappingConfig::from_json(&json).unwrap();
        assert_eq!(deserialized, config);
    }
}
