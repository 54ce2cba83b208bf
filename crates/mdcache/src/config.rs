//! Tunables for the inode cache.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Configuration for a metadata server's inode cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of inodes `InodeCache::trim` tries to keep cached (default: 100 000).
    pub max_inodes: usize,
    /// Seconds a replica waits before re-requesting wanted capability bits
    /// from the authority (default: 5).
    pub caps_wanted_renew_secs: u64,
    /// Half life of popularity counters in seconds (default: 5.0).
    pub popularity_half_life_secs: f64,
    /// Replica nonce kept by a former authority after export (default: 1).
    pub export_nonce: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_inodes: 100_000,
            caps_wanted_renew_secs: 5,
            popularity_half_life_secs: 5.0,
            export_nonce: 1,
        }
    }
}

impl CacheConfig {
    /// Checks that every tunable is in range.
    pub fn validate(&self) -> Result<()> {
        if self.max_inodes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_inodes must be positive".to_string(),
            ));
        }
        if !(self.popularity_half_life_secs.is_finite() && self.popularity_half_life_secs > 0.0) {
            return Err(CacheError::InvalidConfig(format!(
                "popularity_half_life_secs must be positive, got {}",
                self.popularity_half_life_secs
            )));
        }
        if self.export_nonce == 0 {
            return Err(CacheError::InvalidConfig(
                "export_nonce 0 is reserved for authoritative copies".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = CacheConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.caps_wanted_renew_secs, 5);
        assert_eq!(cfg.export_nonce, 1);
    }

    #[test]
    fn test_rejects_bad_half_life() {
        let cfg = CacheConfig {
            popularity_half_life_secs: 0.0,
            ..Default::default()
        };
        match cfg.validate() {
            Err(CacheError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_capacity_and_nonce() {
        let cfg = CacheConfig {
            max_inodes: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = CacheConfig {
            export_nonce: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: CacheConfig = serde_json::from_str(r#"{"max_inodes": 10}"#).unwrap();
        assert_eq!(cfg.max_inodes, 10);
        assert_eq!(cfg.caps_wanted_renew_secs, 5);
    }
}
