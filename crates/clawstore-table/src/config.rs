//! Configuration management for ClawStore tables
//!
//! Provides presets for different deployment classes and validation of
//! the cache, auto-id, lock and flush parameters.

use std::time::Duration;

use crate::error::{ClawError, ClawResult};

/// Table and flush configuration with deployment presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Default read cache capacity (records) for tables without an override
    pub read_cache_capacity: usize,
    /// Default number of reserved low bits in auto-generated ids, in [0, 32]
    pub auto_id_low_bits: u32,
    /// Default value added to auto-generated ids, in [0, 2^auto_id_low_bits)
    pub auto_id_offset: u64,
    /// Number of shard locks in the default lock pool (power of two)
    pub lock_shards: usize,
    /// Background trickle flush cadence
    pub flush_cadence: Duration,
    /// Pending modifications that trigger a flush before the cadence elapses
    pub flush_mod_threshold: u64,
}

impl Config {
    /// Server-class: large caches, relaxed cadence
    pub fn server() -> Self {
        Self {
            read_cache_capacity: 64 * 1024,
            auto_id_low_bits: 0,
            auto_id_offset: 0,
            lock_shards: 65536,
            flush_cadence: Duration::from_secs(60),
            flush_mod_threshold: 200_000,
        }
    }

    /// Embedded-class: small caches, frequent flushes
    pub fn embedded() -> Self {
        Self {
            read_cache_capacity: 4096,
            auto_id_low_bits: 0,
            auto_id_offset: 0,
            lock_shards: 1024,
            flush_cadence: Duration::from_secs(10),
            flush_mod_threshold: 10_000,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> ClawResult<()> {
        if self.read_cache_capacity == 0 {
            return Err(ClawError::InvalidConfig("read_cache_capacity must be > 0".into()));
        }
        validate_auto_id(self.auto_id_low_bits, self.auto_id_offset)?;
        if !self.lock_shards.is_power_of_two() {
            return Err(ClawError::InvalidConfig("lock_shards must be a power of two".into()));
        }
        if self.flush_cadence.as_millis() == 0 {
            return Err(ClawError::InvalidConfig("flush_cadence must be > 0".into()));
        }
        if self.flush_mod_threshold == 0 {
            return Err(ClawError::InvalidConfig("flush_mod_threshold must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}

/// Check an auto-id layout: `low_bits` in [0, 32], `offset` in [0, 2^low_bits).
pub(crate) fn validate_auto_id(low_bits: u32, offset: u64) -> ClawResult<()> {
    if low_bits > 32 {
        return Err(ClawError::InvalidConfig(format!("auto-id low bits {} must be in [0, 32]", low_bits)));
    }
    if offset >= 1u64 << low_bits {
        return Err(ClawError::InvalidConfig(format!(
            "auto-id offset {} must be below 2^{}", offset, low_bits
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::embedded().validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        let s = Config::server();
        let e = Config::embedded();
        assert!(s.read_cache_capacity > e.read_cache_capacity);
        assert!(s.flush_cadence > e.flush_cadence);
    }

    #[test]
    fn test_auto_id_bounds() {
        assert!(validate_auto_id(0, 0).is_ok());
        assert!(validate_auto_id(0, 1).is_err());
        assert!(validate_auto_id(2, 3).is_ok());
        assert!(validate_auto_id(2, 4).is_err());
        assert!(validate_auto_id(32, u32::MAX as u64).is_ok());
        assert!(validate_auto_id(33, 0).is_err());
    }

    #[test]
    fn test_rejects_bad_shards() {
        let mut config = Config::embedded();
        config.lock_shards = 1000;
        assert!(matches!(config.validate(), Err(ClawError::InvalidConfig(_))));
    }
}
