//! # driftcache
//!
//! A persistent key-value cache engine built for the filesystems other
//! caches fail on: cloud drives, SMB shares, NFS mounts, and ordinary
//! local disks. Values are opaque byte blobs addressed by text keys,
//! with bounded-size eviction, per-entry expiration, tags for bulk
//! removal, and safe concurrent access from multiple threads and
//! multiple processes sharing one directory.
//!
//! There is deliberately no monolithic database file anywhere: liveness
//! is tracked by an append-only journal plus a per-entry metadata
//! sidecar next to each value, either of which can rebuild the other.
//! That is what keeps a flaky network mount from corrupting the whole
//! store.
//!
//! ## Quick start
//!
//! ```no_run
//! use driftcache::Cache;
//!
//! let cache = Cache::open("/var/cache/myapp")?;
//! cache.set("greeting", b"hello world")?;
//! assert_eq!(cache.get("greeting")?.as_deref(), Some(&b"hello world"[..]));
//! cache.delete("greeting")?;
//! # Ok::<(), driftcache::CacheError>(())
//! ```
//!
//! For higher write concurrency, [`FanoutCache`] spreads keys over N
//! independent shards under one parent directory.

pub use driftcache_core::{
    CacheConfig, CacheError, CacheResult, EntryMeta, EvictionPolicy, MemoryTierConfig,
};
pub use driftcache_engine::{Cache, CacheStats, FanoutCache, DEFAULT_SHARD_COUNT};
pub use driftcache_storage::{FsProfile, SweepStats};
