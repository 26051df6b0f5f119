use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Policy used by the eviction engine when a write would cross the size or
/// count bound.
///
/// Ties between candidate victims are broken by oldest `last_accessed_at`,
/// then lowest fingerprint, so eviction order is deterministic for a given
/// on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Evict the least recently used entries first. The default.
    Lru,
    /// Evict the least frequently used entries first (by access count).
    Lfu,
    /// Evict the oldest entries first (by creation time).
    Fifo,
    /// Evict the entries closest to expiring first; entries with no expiry
    /// are only considered once every expiring entry is gone.
    TtlAscending,
    /// Never evict. Writes that would cross a bound still succeed; the
    /// caller has opted into unbounded growth.
    None,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// Bounds for the in-process memory tier.
///
/// The memory tier is strictly a latency aid: with all three bounds set to
/// zero the cache produces identical results, just slower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    /// Maximum number of resident entries.
    pub max_entries: usize,

    /// Maximum total value bytes held in memory.
    pub max_bytes: u64,

    /// Soft time-to-live for a resident entry, in seconds. Entries older
    /// than this are refetched from disk on next access.
    pub ttl_seconds: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 64 * 1024 * 1024,
            ttl_seconds: 300,
        }
    }
}

/// Tuning knobs recognized by the cache constructor.
///
/// All limits are enforced at write-return time: when a `set` returns
/// success, the live size sum is within `max_size` and the live entry
/// count within `max_entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Aggregate size bound over live values, in bytes.
    pub max_size: u64,

    /// Live entry count bound.
    pub max_entries: u64,

    /// Largest accepted single value, in bytes.
    pub max_blob_size: u64,

    /// Victim selection policy when a bound would be crossed.
    pub eviction_policy: EvictionPolicy,

    /// Fraction of each bound reclaimed beyond the bound itself when
    /// eviction triggers, so back-to-back writes do not re-trigger it.
    pub eviction_headroom: f64,

    /// Memory tier bounds.
    pub memory_tier: MemoryTierConfig,

    /// Skip legacy single-file store detection on open.
    pub disable_auto_migration: bool,

    /// Deadline for lock acquisitions, in seconds.
    pub operation_timeout_seconds: u64,

    /// Budget for a single blob read or write, in seconds. Exceeding it
    /// aborts the operation and leaves any partial temp file for the
    /// sweeper.
    pub io_timeout_seconds: u64,

    /// Cadence of the background expiration/orphan sweep, in seconds.
    /// Zero disables the background thread; `expire()` still works.
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_blob_size: 16 * 1024 * 1024,
            eviction_policy: EvictionPolicy::default(),
            eviction_headroom: 0.10,
            memory_tier: MemoryTierConfig::default(),
            disable_auto_migration: false,
            operation_timeout_seconds: 30,
            io_timeout_seconds: 10,
            sweep_interval_seconds: 60,
        }
    }
}

impl CacheConfig {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "max_size must be non-zero".into(),
            });
        }
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "max_entries must be non-zero".into(),
            });
        }
        if self.max_blob_size > self.max_size {
            return Err(CacheError::CapacityExceeded {
                size: self.max_blob_size,
                limit: self.max_size,
            });
        }
        if !(0.0..1.0).contains(&self.eviction_headroom) {
            return Err(CacheError::InvalidConfig {
                reason: format!(
                    "eviction_headroom {} outside [0, 1)",
                    self.eviction_headroom
                ),
            });
        }
        if self.operation_timeout_seconds == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "operation_timeout_seconds must be non-zero".into(),
            });
        }
        if self.io_timeout_seconds == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "io_timeout_seconds must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Size the eviction engine reclaims down to, bound included.
    pub fn size_low_water(&self) -> u64 {
        (self.max_size as f64 * (1.0 - self.eviction_headroom)) as u64
    }

    /// Entry count the eviction engine reclaims down to.
    pub fn entries_low_water(&self) -> u64 {
        (self.max_entries as f64 * (1.0 - self.eviction_headroom)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_bounds_rejected() {
        let mut config = CacheConfig::default();
        config.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn blob_ceiling_cannot_exceed_total() {
        let mut config = CacheConfig::default();
        config.max_blob_size = config.max_size + 1;
        assert!(matches!(
            config.validate(),
            Err(CacheError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn low_water_marks_apply_headroom() {
        let config = CacheConfig {
            max_size: 1000,
            max_entries: 100,
            eviction_headroom: 0.10,
            ..CacheConfig::default()
        };
        assert_eq!(config.size_low_water(), 900);
        assert_eq!(config.entries_low_water(), 90);
    }
}
