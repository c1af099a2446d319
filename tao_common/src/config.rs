//! Runtime-configurable defaults, loadable from TOML.
//!
//! Any `serde::Deserialize` type gets a blanket `load(path)` for free.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::SHM_MIN_SIZE;

/// Error loading or validating a [`TaoConfig`].
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("configuration file not found")]
    FileNotFound,
    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Runtime defaults for the shared-object hierarchy.
///
/// This does not implement the `/tmp/tao/<name>` shmid-discovery file
/// mechanism (out of scope) — only the core's own tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaoConfig {
    /// Default data-section size for a newly created segment.
    #[serde(default = "default_segment_size")]
    pub default_segment_size: usize,
    /// Default ring depth for a newly created remote object.
    #[serde(default = "default_nbufs")]
    pub default_nbufs: usize,
    /// Default owner string stamped into a newly created remote object.
    #[serde(default = "default_owner")]
    pub default_owner: String,
    /// Grace period (seconds) before an unattached segment with a dead
    /// writer is considered orphaned.
    #[serde(default = "default_grace_period_s")]
    pub orphan_grace_period_s: u64,
    /// Open Question: whether `wait_command` reports `TIMEOUT` (true) or
    /// a distinct server-killed condition (false, the recorded default) when
    /// the server transitions to `quitting` before catching up.
    #[serde(default)]
    pub assume_timeout_if_server_killed: bool,
}

fn default_segment_size() -> usize {
    SHM_MIN_SIZE
}
fn default_nbufs() -> usize {
    4
}
fn default_owner() -> String {
    String::from("tao")
}
fn default_grace_period_s() -> u64 {
    10
}

impl Default for TaoConfig {
    fn default() -> Self {
        Self {
            default_segment_size: default_segment_size(),
            default_nbufs: default_nbufs(),
            default_owner: default_owner(),
            orphan_grace_period_s: default_grace_period_s(),
            assume_timeout_if_server_killed: false,
        }
    }
}

impl TaoConfig {
    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_segment_size < SHM_MIN_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "default_segment_size={} is below SHM_MIN_SIZE={}",
                self.default_segment_size, SHM_MIN_SIZE
            )));
        }
        if self.default_nbufs < 2 {
            return Err(ConfigError::ValidationError(format!(
                "default_nbufs={} must be >= 2",
                self.default_nbufs
            )));
        }
        if self.default_owner.len() >= crate::consts::OWNER_NAME_MAX {
            return Err(ConfigError::ValidationError(format!(
                "default_owner too long: {} bytes >= {}",
                self.default_owner.len(),
                crate::consts::OWNER_NAME_MAX
            )));
        }
        Ok(())
    }
}

/// Load a `serde`-deserializable configuration type from a TOML file.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load and parse `path` as TOML.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        assert!(TaoConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_segment_size() {
        let mut cfg = TaoConfig::default();
        cfg.default_segment_size = 128;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "default_nbufs = 8").unwrap();
        file.flush().unwrap();

        let cfg = TaoConfig::load(file.path()).unwrap();
        assert_eq!(cfg.default_nbufs, 8);
        assert_eq!(cfg.default_segment_size, SHM_MIN_SIZE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_is_reported() {
        let result = TaoConfig::load(Path::new("/nonexistent/tao.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }
}
