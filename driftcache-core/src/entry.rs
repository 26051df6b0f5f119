use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Longest accepted key, in Unicode code points.
pub const MAX_KEY_CHARS: usize = 1024;

/// Longest accepted tag, in Unicode code points.
pub const MAX_TAG_CHARS: usize = 16;

/// Most tags a single entry may carry.
pub const MAX_TAGS_PER_ENTRY: usize = 8;

/// Byte length of a counter payload (`incr`/`decr`).
pub const COUNTER_PAYLOAD_LEN: usize = 8;

/// Wall-clock seconds since the Unix epoch.
///
/// The engine stores second-granularity timestamps everywhere; the clock
/// only needs to be monotonic enough for recency ordering across
/// processes sharing a directory.
pub fn now_epoch_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Per-entry metadata, shared verbatim by the journal records, the `.meta`
/// sidecars, and the snapshot.
///
/// The sidecar copy is what makes the index rebuildable from the blob tree
/// alone: every field needed to resurrect an index record lives next to
/// the blob it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Stored byte length of the value; always equals the blob file's
    /// length on disk.
    pub size: u64,

    /// Wall-clock seconds at `set`.
    pub created_at: u64,

    /// Wall-clock seconds at the most recent successful `get`.
    pub last_accessed_at: u64,

    /// Absolute expiry deadline; a past deadline means logically absent.
    pub expires_at: Option<u64>,

    /// Unordered short labels used by bulk-by-tag eviction.
    pub tags: Vec<String>,

    /// Monotonically non-decreasing hit counter, consumed by the
    /// frequency-weighted eviction policy.
    pub access_count: u64,
}

impl EntryMeta {
    /// Metadata for a freshly written entry.
    pub fn new(size: u64, expires_at: Option<u64>, tags: Vec<String>) -> Self {
        let now = now_epoch_secs();
        Self {
            size,
            created_at: now,
            last_accessed_at: now,
            expires_at,
            tags,
            access_count: 0,
        }
    }

    /// Whether the entry is logically absent at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    /// Record a successful read.
    pub fn note_access(&mut self, now: u64) {
        self.last_accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Enforce the key text rules: non-empty, at most [`MAX_KEY_CHARS`] code
/// points.
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey {
            reason: "key is empty".into(),
        });
    }
    let chars = key.chars().count();
    if chars > MAX_KEY_CHARS {
        return Err(CacheError::InvalidKey {
            reason: format!("key is {chars} code points, limit is {MAX_KEY_CHARS}"),
        });
    }
    Ok(())
}

/// Enforce the tag rules: at most [`MAX_TAGS_PER_ENTRY`] tags of at most
/// [`MAX_TAG_CHARS`] code points each, none empty.
pub fn validate_tags(tags: &[String]) -> CacheResult<()> {
    if tags.len() > MAX_TAGS_PER_ENTRY {
        return Err(CacheError::InvalidKey {
            reason: format!("{} tags, limit is {MAX_TAGS_PER_ENTRY}", tags.len()),
        });
    }
    for tag in tags {
        if tag.is_empty() {
            return Err(CacheError::InvalidKey {
                reason: "tag is empty".into(),
            });
        }
        let chars = tag.chars().count();
        if chars > MAX_TAG_CHARS {
            return Err(CacheError::InvalidKey {
                reason: format!("tag {tag:?} is {chars} code points, limit is {MAX_TAG_CHARS}"),
            });
        }
    }
    Ok(())
}

/// Canonical little-endian encoding of a counter value.
pub fn encode_counter(value: i64) -> [u8; COUNTER_PAYLOAD_LEN] {
    value.to_le_bytes()
}

/// Decode a counter payload; anything but exactly 8 bytes is a type
/// mismatch.
pub fn decode_counter(payload: &[u8]) -> CacheResult<i64> {
    let bytes: [u8; COUNTER_PAYLOAD_LEN] = payload
        .try_into()
        .map_err(|_| CacheError::TypeMismatch { len: payload.len() })?;
    Ok(i64::from_le_bytes(bytes))
}
