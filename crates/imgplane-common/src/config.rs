//! Configuration for imgplane clients
//!
//! Loaded from a TOML file; every key has a default so an empty file is a
//! valid configuration.

use crate::error::{Error, Result};
use crate::types::Features;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How an image handle obtains the exclusive lock when an operation needs it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Request the lock on demand
    #[default]
    Auto,
    /// Only an explicit acquire takes the lock
    Manual,
}

/// Root configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Name of the local cluster, used to reject self-peering
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default)]
    pub image: ImageDefaults,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub management: ManagementConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            image: ImageDefaults::default(),
            lock: LockConfig::default(),
            management: ManagementConfig::default(),
        }
    }
}

/// Defaults applied to new images
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageDefaults {
    /// Object size as a power of two
    #[serde(default = "default_order")]
    pub order: u8,
    #[serde(default = "default_format")]
    pub format: u8,
    #[serde(default = "default_features")]
    pub features: u64,
    /// 0 means one object
    #[serde(default)]
    pub stripe_unit: u64,
    #[serde(default = "default_stripe_count")]
    pub stripe_count: u64,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            order: default_order(),
            format: default_format(),
            features: default_features(),
            stripe_unit: 0,
            stripe_count: default_stripe_count(),
        }
    }
}

impl ImageDefaults {
    #[must_use]
    pub const fn features(&self) -> Features {
        Features::from_bits_retain(self.features)
    }
}

/// Exclusive and advisory lock settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Blacklist the previous owner before breaking its lock
    #[serde(default = "default_true")]
    pub blacklist_on_break_lock: bool,
    /// 0 uses the store's default expiry
    #[serde(default)]
    pub blacklist_expire_seconds: u64,
    #[serde(default)]
    pub policy: LockPolicy,
    /// Delay before the single retry of a failed release
    #[serde(default = "default_release_retry_delay_ms")]
    pub release_retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            blacklist_on_break_lock: true,
            blacklist_expire_seconds: 0,
            policy: LockPolicy::default(),
            release_retry_delay_ms: default_release_retry_delay_ms(),
        }
    }
}

/// Bulk operation tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Outstanding chunk operations for copy, flatten and trim
    #[serde(default = "default_concurrent_management_ops")]
    pub concurrent_management_ops: usize,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            concurrent_management_ops: default_concurrent_management_ops(),
        }
    }
}

fn default_cluster_name() -> String {
    "ceph".to_string()
}

const fn default_order() -> u8 {
    22
}

const fn default_format() -> u8 {
    2
}

const fn default_features() -> u64 {
    Features::LAYERING
        .union(Features::EXCLUSIVE_LOCK)
        .union(Features::OBJECT_MAP)
        .union(Features::FAST_DIFF)
        .union(Features::DEEP_FLATTEN)
        .bits()
}

const fn default_stripe_count() -> u64 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_release_retry_delay_ms() -> u64 {
    100
}

const fn default_concurrent_management_ops() -> usize {
    10
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values no operation could work with
    pub fn validate(&self) -> Result<()> {
        if !(12..=25).contains(&self.image.order) {
            return Err(Error::Configuration(format!(
                "image.order {} outside 12..=25",
                self.image.order
            )));
        }
        if !matches!(self.image.format, 1 | 2) {
            return Err(Error::Configuration(format!(
                "image.format must be 1 or 2, got {}",
                self.image.format
            )));
        }
        if !Features::ALL.contains(self.image.features()) {
            return Err(Error::Configuration(format!(
                "image.features has unknown bits {:#x}",
                self.image.features
            )));
        }
        if self.management.concurrent_management_ops == 0 {
            return Err(Error::Configuration(
                "management.concurrent_management_ops must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.cluster_name, "ceph");
        assert_eq!(config.image.order, 22);
        assert_eq!(config.image.format, 2);
        assert!(config.image.features().contains(Features::LAYERING));
        assert!(config.lock.blacklist_on_break_lock);
        assert_eq!(config.lock.policy, LockPolicy::Auto);
        assert_eq!(config.management.concurrent_management_ops, 10);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml_str(
            r#"
            cluster_name = "site-a"

            [lock]
            policy = "manual"
            blacklist_expire_seconds = 30

            [management]
            concurrent_management_ops = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster_name, "site-a");
        assert_eq!(config.lock.policy, LockPolicy::Manual);
        assert_eq!(config.lock.blacklist_expire_seconds, 30);
        assert!(config.lock.blacklist_on_break_lock);
        assert_eq!(config.management.concurrent_management_ops, 4);
        assert_eq!(config.image.order, 22);
    }

    #[test]
    fn test_invalid_order_rejected() {
        let err = Config::from_toml_str("[image]\norder = 30\n").unwrap_err();
        assert_eq!(err.condition(), "configuration");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[image]\norder = 20").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.image.order, 20);
    }
}
