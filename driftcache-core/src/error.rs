use std::time::Duration;

/// Convenience alias used across every driftcache crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Every failure a caller can observe, as a discriminated value.
///
/// The absence of a key is *not* represented here: `get`, `pop` and `touch`
/// report absence through their return value. [`CacheError::NotFound`] is
/// reserved for operations whose contract requires the key to exist.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The operation required a live entry and none was present.
    #[error("key not found")]
    NotFound,

    /// `add` observed a live entry under the requested key.
    #[error("key already present")]
    AlreadyPresent,

    /// `incr`/`decr` found a payload that is not a counter (exactly 8
    /// little-endian bytes).
    #[error("existing value is not a counter payload ({len} bytes)")]
    TypeMismatch { len: usize },

    /// A lock or per-operation deadline elapsed. Never retried internally;
    /// retry is the caller's decision.
    #[error("{op} timed out after {waited:?}")]
    Timeout { op: &'static str, waited: Duration },

    /// Blob bytes did not match the sidecar's size or checksum. The entry
    /// is deleted on the next access and reported absent from then on.
    #[error("entry for {key:?} is corrupted: {reason}")]
    CorruptedEntry { key: String, reason: String },

    /// Journal verification failed. The next open falls back to a full
    /// directory rescan; blobs are never silently discarded.
    #[error("index journal is corrupted: {reason}")]
    CorruptedIndex { reason: String },

    /// The value is larger than the configured blob ceiling.
    #[error("value of {size} bytes exceeds the {limit} byte limit")]
    CapacityExceeded { size: u64, limit: u64 },

    /// A key or tag violated the text rules (empty, too long, too many).
    #[error("invalid key or tag: {reason}")]
    InvalidKey { reason: String },

    /// The constructor was handed a configuration the engine cannot honor.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Importing the legacy single-file store failed; nothing was mutated.
    #[error("legacy store migration failed: {reason}")]
    MigrationFailed { reason: String },

    /// The underlying filesystem failed.
    #[error("I/O failure: {0}")]
    IOError(#[from] std::io::Error),
}

impl CacheError {
    pub fn corrupted_entry(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::CorruptedEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupted_index(reason: impl Into<String>) -> Self {
        CacheError::CorruptedIndex {
            reason: reason.into(),
        }
    }

    pub fn migration_failed(reason: impl Into<String>) -> Self {
        CacheError::MigrationFailed {
            reason: reason.into(),
        }
    }

    /// True for the corruption kinds that self-heal on the next access.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CacheError::CorruptedEntry { .. } | CacheError::CorruptedIndex { .. }
        )
    }
}
