//! # driftcache engine
//!
//! The operation surface of the cache: the [`Cache`] facade over one
//! directory, the [`FanoutCache`] composite over N of them, and the
//! in-process pieces between callers and the storage subsystem (the
//! memory tier and the eviction engine).
//!
//! ## Operation flow
//!
//! A write stages its value to a uniquely named temp file with no lock
//! held, then performs the rename and the journal append inside the
//! index's critical section, then updates the memory tier and runs
//! synchronous eviction when a bound was crossed. A read consults the
//! memory tier, falls back to the index and the blob store, checks
//! expiration at each step, and repopulates the memory tier on the way
//! out.

mod cache;     // The facade: get/set/add/delete/incr/pop/touch/clear/stats
mod eviction;  // Victim selection for the configured policy
mod fanout;    // Hash dispatch over N core instances
mod memory;    // Bounded in-process tier of recently used entries

pub use cache::{Cache, CacheStats};
pub use fanout::{FanoutCache, DEFAULT_SHARD_COUNT};
pub use memory::{MemoryHit, MemoryTier};
