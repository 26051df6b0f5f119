use std::path::Path;

use tracing::info;

use driftcache_core::{CacheConfig, CacheError, CacheResult};
use driftcache_storage::fingerprint;

use crate::cache::{Cache, CacheStats};

/// Default shard fan-out.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// A composite cache over N independent cores sharing a parent
/// directory (`shard_000/ … shard_NNN/`).
///
/// Sharding is purely a capacity and contention lever: each key lives
/// in exactly one shard, chosen by fingerprint, and every per-key
/// operation keeps the single-core semantics. The configured bounds
/// are split evenly across shards so the composite honors them in
/// aggregate.
#[derive(Debug)]
pub struct FanoutCache {
    shards: Vec<Cache>,
}

impl FanoutCache {
    pub fn open(dir: impl AsRef<Path>) -> CacheResult<FanoutCache> {
        Self::open_with(dir, DEFAULT_SHARD_COUNT, CacheConfig::default())
    }

    pub fn open_with(
        dir: impl AsRef<Path>,
        shard_count: usize,
        config: CacheConfig,
    ) -> CacheResult<FanoutCache> {
        if shard_count == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "shard_count must be non-zero".into(),
            });
        }
        let per_shard = CacheConfig {
            max_size: (config.max_size / shard_count as u64).max(1),
            max_entries: (config.max_entries / shard_count as u64).max(1),
            max_blob_size: config
                .max_blob_size
                .min((config.max_size / shard_count as u64).max(1)),
            ..config
        };

        let dir = dir.as_ref();
        let mut shards = Vec::with_capacity(shard_count);
        for n in 0..shard_count {
            let shard_dir = dir.join(format!("shard_{n:03}"));
            shards.push(Cache::open_with(shard_dir, per_shard.clone())?);
        }
        info!(shard_count, dir = %dir.display(), "opened fan-out cache");
        Ok(FanoutCache { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &str) -> &Cache {
        let n = self.shards.len() as u64;
        &self.shards[(fingerprint(key) % n) as usize]
    }

    pub fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.shard(key).set(key, value)
    }

    pub fn set_with(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<u64>,
        tags: &[String],
    ) -> CacheResult<()> {
        self.shard(key).set_with(key, value, expires_at, tags)
    }

    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.shard(key).get(key)
    }

    pub fn add(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.shard(key).add(key, value)
    }

    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        self.shard(key).delete(key)
    }

    pub fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.shard(key).incr(key, delta)
    }

    pub fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.shard(key).decr(key, delta)
    }

    pub fn pop(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.shard(key).pop(key)
    }

    pub fn touch(&self, key: &str, expires_at: Option<u64>) -> CacheResult<bool> {
        self.shard(key).touch(key, expires_at)
    }

    pub fn contains(&self, key: &str) -> CacheResult<bool> {
        self.shard(key).contains(key)
    }

    pub fn clear(&self) -> CacheResult<u64> {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.clear()?;
        }
        Ok(removed)
    }

    pub fn evict_by_tag(&self, tag: &str) -> CacheResult<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.evict_by_tag(tag)?;
        }
        Ok(removed)
    }

    pub fn scan(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.scan()?);
        }
        Ok(keys)
    }

    pub fn expire(&self) -> CacheResult<usize> {
        let mut expired = 0;
        for shard in &self.shards {
            expired += shard.expire()?;
        }
        Ok(expired)
    }

    pub fn len(&self) -> u64 {
        self.shards.iter().map(Cache::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Cache::is_empty)
    }

    pub fn volume(&self) -> u64 {
        self.shards.iter().map(Cache::volume).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for stats in self.shards.iter().map(Cache::stats) {
            total.hits += stats.hits;
            total.misses += stats.misses;
            total.sets += stats.sets;
            total.deletes += stats.deletes;
            total.evictions += stats.evictions;
            total.size += stats.size;
            total.count += stats.count;
        }
        total
    }

    pub fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }
}
