//! Cache configuration
//!
//! Every struct has a `Default` matching the production limits and derives
//! `Deserialize` with `#[serde(default)]`, so a YAML file only needs to name
//! the values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Default maximum concurrent resolutions for preload/prefetch
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

// =============================================================================
// Tier Limits
// =============================================================================

/// Item and byte budget of a single tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum number of entries
    pub max_items: usize,
    /// Maximum total payload bytes
    pub max_bytes: u64,
}

impl TierConfig {
    pub const fn new(max_items: usize, max_bytes: u64) -> Self {
        Self {
            max_items,
            max_bytes,
        }
    }

    /// Memory tier limits when backed by a persistent tier
    pub const fn memory() -> Self {
        Self::new(50, 50 * MIB)
    }

    /// Memory tier limits when the persistent tier is unavailable
    pub const fn memory_standalone() -> Self {
        Self::new(100, 100 * MIB)
    }

    /// Persistent tier limits
    pub const fn persistent() -> Self {
        Self::new(500, 200 * MIB)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_items == 0 || self.max_bytes == 0 {
            return Err(Error::Config(format!(
                "{} tier limits must be non-zero (items={}, bytes={})",
                name, self.max_items, self.max_bytes
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Origin endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// API base URL, e.g. `https://choir.example.org/api`
    pub base_url: String,
    /// Per-request timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8088/api".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier limits with a persistent tier behind it
    pub memory: TierConfig,
    /// Memory tier limits when running memory-only
    pub memory_standalone: TierConfig,
    /// Persistent tier limits
    pub persistent: TierConfig,
    /// Fraction of `persistent.max_bytes` to evict down to after an overflow
    pub persistent_low_watermark: f64,
    /// Fraction of `persistent.max_bytes` to evict down to after a quota error
    pub quota_low_watermark: f64,
    /// Default bulk concurrency
    pub max_concurrent: usize,
    /// Origin endpoints
    pub origin: OriginConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: TierConfig::memory(),
            memory_standalone: TierConfig::memory_standalone(),
            persistent: TierConfig::persistent(),
            persistent_low_watermark: 0.8,
            quota_low_watermark: 0.5,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            origin: OriginConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check limits and ratios
    pub fn validate(&self) -> Result<()> {
        self.memory.validate("memory")?;
        self.memory_standalone.validate("memory_standalone")?;
        self.persistent.validate("persistent")?;

        for (name, ratio) in [
            ("persistent_low_watermark", self.persistent_low_watermark),
            ("quota_low_watermark", self.quota_low_watermark),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(Error::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }

        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".into()));
        }
        Ok(())
    }

    /// Memory limits for the given persistent tier availability
    pub fn memory_limits(&self, persistent_available: bool) -> TierConfig {
        if persistent_available {
            self.memory
        } else {
            self.memory_standalone
        }
    }

    /// Byte target after a regular overflow
    pub fn persistent_target_bytes(&self) -> u64 {
        (self.persistent.max_bytes as f64 * self.persistent_low_watermark) as u64
    }

    /// Byte target after a quota-exceeded write
    pub fn quota_target_bytes(&self) -> u64 {
        (self.persistent.max_bytes as f64 * self.quota_low_watermark) as u64
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = CacheConfig::default();
        assert_eq!(config.memory, TierConfig::new(50, 50 * MIB));
        assert_eq!(config.memory_standalone, TierConfig::new(100, 100 * MIB));
        assert_eq!(config.persistent, TierConfig::new(500, 200 * MIB));
        assert_eq!(config.max_concurrent, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_limits_follow_availability() {
        let config = CacheConfig::default();
        assert_eq!(config.memory_limits(true).max_items, 50);
        assert_eq!(config.memory_limits(false).max_items, 100);
    }

    #[test]
    fn test_watermark_targets() {
        let config = CacheConfig::default();
        assert_eq!(config.persistent_target_bytes(), 160 * MIB);
        assert_eq!(config.quota_target_bytes(), 100 * MIB);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
memory:
  max_items: 10
  max_bytes: 1048576
origin:
  base_url: "https://choir.example.org/api"
  timeout: 5
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.memory, TierConfig::new(10, MIB));
        assert_eq!(config.persistent, TierConfig::persistent());
        assert_eq!(config.origin.timeout, Duration::from_secs(5));
        assert_eq!(config.origin.base_url, "https://choir.example.org/api");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(CacheConfig::from_yaml_str("max_concurrent: 0").is_err());
        assert!(CacheConfig::from_yaml_str("quota_low_watermark: 1.5").is_err());
        assert!(CacheConfig::from_yaml_str("memory:\n  max_items: 0\n  max_bytes: 1").is_err());
        assert!(CacheConfig::from_yaml_str("memory: [").is_err());
    }
}
