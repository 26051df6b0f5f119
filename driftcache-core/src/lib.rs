//! # driftcache core types
//!
//! Shared vocabulary for the driftcache engine: configuration, error kinds,
//! and per-entry metadata. Nothing in this crate touches the filesystem;
//! the storage and engine crates build on these definitions.
//!
//! ## Design constraints
//!
//! - Every error a caller can observe is a discriminated variant of
//!   [`CacheError`]; "key absent" is an absent value, not an error.
//! - Entry metadata is the single serialized record shared by the journal,
//!   the `.meta` sidecars, and the snapshot, so the three stay mutually
//!   replayable.
//! - Timestamps are wall-clock seconds since the Unix epoch, stored as
//!   `u64`. Sub-second precision buys nothing on the filesystems this
//!   engine targets.

mod config;    // Cache tuning knobs, eviction policy selection, validation
mod entry;     // Entry metadata, key and tag rules, counter payload codec
mod error;     // Caller-visible error kinds

pub use config::{CacheConfig, EvictionPolicy, MemoryTierConfig};
pub use entry::{
    decode_counter, encode_counter, now_epoch_secs, validate_key, validate_tags, EntryMeta,
    COUNTER_PAYLOAD_LEN, MAX_KEY_CHARS, MAX_TAGS_PER_ENTRY, MAX_TAG_CHARS,
};
pub use error::{CacheError, CacheResult};
