//! Upgrade configuration: filesystem roots, allow-list, thresholds.

use crate::protocol::{DEFAULT_LOW_MEMORY_BYTES, ROLLBACK_SUCCESS_THRESHOLD};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// The live filesystem root the firmware runs from.
    pub device_root: PathBuf,

    /// Where incoming files land until COMMIT. Mirrors the live layout.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,

    /// Where pre-upgrade originals are kept until apply succeeds.
    #[serde(default)]
    pub backup_root: Option<PathBuf>,

    /// First path segments under which directory creation is permitted.
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<String>,

    /// Identifier reported by UPGRADE:VERSION.
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,

    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: f64,

    #[serde(default = "default_low_memory_bytes")]
    pub low_memory_bytes: u64,
}

fn default_allowed_roots() -> Vec<String> {
    vec!["lib".to_string()]
}

fn default_firmware_version() -> String {
    format!("firmup-{}", env!("CARGO_PKG_VERSION"))
}

fn default_rollback_threshold() -> f64 {
    ROLLBACK_SUCCESS_THRESHOLD
}

fn default_low_memory_bytes() -> u64 {
    DEFAULT_LOW_MEMORY_BYTES
}

impl UpgradeConfig {
    /// Config with defaults for a given device root.
    pub fn for_root(device_root: impl Into<PathBuf>) -> Self {
        Self {
            device_root: device_root.into(),
            staging_root: None,
            backup_root: None,
            allowed_roots: default_allowed_roots(),
            firmware_version: default_firmware_version(),
            rollback_threshold: default_rollback_threshold(),
            low_memory_bytes: default_low_memory_bytes(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: UpgradeConfig =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Staging tree location; lives beside the live files by default so
    /// the final copy stays on one filesystem.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| self.device_root.join("upgrade_staging"))
    }

    pub fn backup_root(&self) -> PathBuf {
        self.backup_root
            .clone()
            .unwrap_or_else(|| self.device_root.join("upgrade_backup"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let cfg = UpgradeConfig::for_root("/flash");
        assert_eq!(cfg.allowed_roots, vec!["lib".to_string()]);
        assert_eq!(cfg.staging_root(), PathBuf::from("/flash/upgrade_staging"));
        assert_eq!(cfg.backup_root(), PathBuf::from("/flash/upgrade_backup"));
        assert!((cfg.rollback_threshold - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: UpgradeConfig = toml::from_str(r#"device_root = "/flash""#).unwrap();
        assert_eq!(cfg.device_root, PathBuf::from("/flash"));
        assert_eq!(cfg.firmware_version, default_firmware_version());
    }

    #[test]
    fn toml_overrides_allow_list() {
        let cfg: UpgradeConfig = toml::from_str(
            r#"
device_root = "/flash"
allowed_roots = ["lib", "apps"]
rollback_threshold = 0.9
"#,
        )
        .unwrap();
        assert_eq!(cfg.allowed_roots.len(), 2);
        assert!((cfg.rollback_threshold - 0.9).abs() < f64::EPSILON);
    }
}
