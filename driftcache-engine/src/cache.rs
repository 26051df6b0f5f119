use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use driftcache_core::{
    decode_counter, encode_counter, now_epoch_secs, validate_key, validate_tags, CacheConfig,
    CacheError, CacheResult, EntryMeta, EvictionPolicy,
};
use driftcache_storage::{
    fingerprint, import_legacy_store, legacy_store_present, sweep_once, BlobStore, FsProfile,
    Index, IndexRecord, KeyLocks, ShardLayout, Sidecar, Sweeper,
};

use crate::eviction::select_victims;
use crate::memory::MemoryTier;

/// Passes over the victim list before eviction gives up on entries that
/// stay write-locked.
const EVICTION_PASSES: u32 = 3;

/// Reads retried before a checksum mismatch is believed; a concurrent
/// overwrite can pair a fresh value file with a not-yet-replaced
/// sidecar for one instant.
const READ_ATTEMPTS: u32 = 2;

/// Snapshot of the in-process operation counters plus the live
/// size/count measures. Counters reset on reopen; they are not
/// persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub size: u64,
    pub count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// The cache facade: a persistent key-value store over one directory.
///
/// Values are opaque byte blobs up to the configured ceiling, addressed
/// by text keys. All operations are synchronous; concurrent calls from
/// multiple threads and multiple processes sharing the directory are
/// supported, serialized through the journal's inter-process lock.
///
/// Write path: value staged to a temp file (no locks), then rename plus
/// journal append inside the critical section, then memory tier update
/// and, when a bound was crossed, synchronous eviction.
///
/// Read path: memory tier, then index, then blob store, with an
/// expiration check at each level.
#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    config: CacheConfig,
    index: Arc<Index>,
    blob: Arc<BlobStore>,
    key_locks: Arc<KeyLocks>,
    memory: MemoryTier,
    counters: Counters,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Cache {
    /// Open (or create) a cache under `dir` with default configuration.
    pub fn open(dir: impl AsRef<Path>) -> CacheResult<Cache> {
        Self::open_with(dir, CacheConfig::default())
    }

    /// Open (or create) a cache under `dir`.
    ///
    /// Construction probes the filesystem, replays the index journal,
    /// imports a legacy single-file store when one is present and no
    /// index has ever been written, and starts the background sweeper.
    pub fn open_with(dir: impl AsRef<Path>, config: CacheConfig) -> CacheResult<Cache> {
        config.validate()?;
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let profile = FsProfile::probe(&root)?;
        let lock_timeout = Duration::from_secs(config.operation_timeout_seconds);
        let io_timeout = Duration::from_secs(config.io_timeout_seconds);

        let migrate_pending = !config.disable_auto_migration && legacy_store_present(&root);

        let index = Arc::new(Index::open(&root, profile, lock_timeout)?);
        let blob = Arc::new(BlobStore::new(ShardLayout::new(&root), profile, io_timeout));
        let key_locks = Arc::new(KeyLocks::new());

        let cache = Cache {
            memory: MemoryTier::new(config.memory_tier.clone()),
            root: root.clone(),
            config,
            index,
            blob,
            key_locks,
            counters: Counters::default(),
            sweeper: Mutex::new(None),
        };

        if migrate_pending {
            info!(dir = %root.display(), "legacy store detected, importing");
            let imported = import_legacy_store(&root, |row| {
                cache.set_with(&row.key, &row.value, row.expires_at, &row.tags)
            })?;
            info!(imported, "legacy store import complete");
            // Replayed rows are not caller operations.
            cache.counters.reset();
        }

        if cache.config.sweep_interval_seconds > 0 {
            let sweeper = Sweeper::spawn(
                Duration::from_secs(cache.config.sweep_interval_seconds),
                Arc::clone(&cache.index),
                Arc::clone(&cache.blob),
                Arc::clone(&cache.key_locks),
            )?;
            *cache.sweeper.lock() = Some(sweeper);
        }

        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `value` under `key` with no expiry and no tags.
    pub fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.set_with(key, value, None, &[])
    }

    /// Store `value` under `key`. `expires_at` is an absolute epoch
    /// deadline; `tags` label the entry for bulk eviction. Overwrites
    /// are atomic from a reader's perspective.
    pub fn set_with(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<u64>,
        tags: &[String],
    ) -> CacheResult<()> {
        validate_key(key)?;
        validate_tags(tags)?;
        self.write_entry(key, value, expires_at, tags.to_vec())?;
        Ok(())
    }

    /// As `set`, but fails with [`CacheError::AlreadyPresent`] when a
    /// live entry exists. Check and write happen under the per-key
    /// write lock.
    pub fn add(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.add_with(key, value, None, &[])
    }

    pub fn add_with(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<u64>,
        tags: &[String],
    ) -> CacheResult<()> {
        validate_key(key)?;
        validate_tags(tags)?;
        let _guard = self.key_locks.acquire(key, self.lock_timeout())?;
        self.index.refresh()?;
        let now = now_epoch_secs();
        if let Some(record) = self.index.lookup(key) {
            if !record.meta.is_expired_at(now) {
                return Err(CacheError::AlreadyPresent);
            }
        }
        self.write_entry(key, value, expires_at, tags.to_vec())?;
        Ok(())
    }

    /// Fetch the value under `key`, or `None` when absent or expired.
    /// An expired entry is deleted on the spot.
    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let now = now_epoch_secs();

        if let Some(hit) = self.memory.get(key, now) {
            // Another process may have deleted or replaced the entry;
            // the index, not the memory tier, owns liveness. Currency
            // is proven by the journal sequence of the value's PUT:
            // wall-clock metadata cannot tell two same-second writes
            // of equal-length values apart.
            self.index.refresh()?;
            match self.index.lookup(key) {
                Some(record)
                    if !record.meta.is_expired_at(now)
                        && record.value_seq == hit.value_seq =>
                {
                    self.index.note_access(key, now);
                    let mut meta = record.meta;
                    meta.note_access(now);
                    self.memory.update_meta(key, meta, false);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(hit.value.to_vec()));
                }
                Some(record) if record.meta.is_expired_at(now) => {
                    self.remove_entry(key)?;
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(_) => {
                    // Replaced behind our back; fall through to disk.
                    self.memory.invalidate(key);
                }
                None => {
                    self.memory.invalidate(key);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        } else {
            self.index.refresh()?;
        }

        let mut last_err: Option<CacheError> = None;
        for _ in 0..READ_ATTEMPTS {
            let Some(record) = self.index.lookup(key) else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            };
            if record.meta.is_expired_at(now) {
                self.remove_entry(key)?;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            match self.blob.read(record.fingerprint, &record.stem, key) {
                Ok((bytes, actual_stem)) => {
                    if actual_stem != record.stem {
                        self.index.fix_stem(key, &actual_stem);
                    }
                    let mut meta = record.meta.clone();
                    meta.note_access(now);
                    {
                        let mut txn = self.index.write_txn()?;
                        txn.touch(key, meta.clone())?;
                    }
                    self.memory
                        .insert(key, Arc::new(bytes.clone()), meta, record.value_seq);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(bytes));
                }
                Err(CacheError::NotFound) => {
                    // Deleted between lookup and read by someone else.
                    self.index.refresh()?;
                    last_err = None;
                }
                Err(e @ CacheError::CorruptedEntry { .. }) => {
                    // Possibly a mid-overwrite read; retry before
                    // believing it.
                    self.index.refresh()?;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_err {
            Some(err) => {
                warn!(key, "corrupted entry detected, removing");
                self.remove_entry(key)?;
                Err(err)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Remove the entry under `key`. Returns whether one was present.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        let removed = self.remove_entry(key)?;
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Atomically add `delta` to the counter stored under `key`,
    /// creating it from zero when absent. The payload must be the
    /// canonical 8-byte little-endian encoding.
    pub fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        validate_key(key)?;
        let _guard = self.key_locks.acquire(key, self.lock_timeout())?;
        self.index.refresh()?;
        let now = now_epoch_secs();

        let live = self
            .index
            .lookup(key)
            .filter(|record| !record.meta.is_expired_at(now));
        let (old, expires_at, tags) = match live {
            Some(record) => match self.blob.read(record.fingerprint, &record.stem, key) {
                Ok((bytes, _)) => (
                    decode_counter(&bytes)?,
                    record.meta.expires_at,
                    record.meta.tags.clone(),
                ),
                Err(CacheError::NotFound) => (0, record.meta.expires_at, record.meta.tags.clone()),
                Err(e @ CacheError::CorruptedEntry { .. }) => {
                    self.remove_entry(key)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
            None => (0, None, Vec::new()),
        };

        let new = old.wrapping_add(delta);
        self.write_entry(key, &encode_counter(new), expires_at, tags)?;
        Ok(new)
    }

    /// `incr` with the sign flipped.
    pub fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.incr(key, delta.wrapping_neg())
    }

    /// Atomically read and delete. Returns the value, or `None` when
    /// the key was absent or expired.
    pub fn pop(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let _guard = self.key_locks.acquire(key, self.lock_timeout())?;
        self.index.refresh()?;
        let now = now_epoch_secs();

        let Some(record) = self.index.lookup(key) else {
            return Ok(None);
        };
        if record.meta.is_expired_at(now) {
            self.remove_entry(key)?;
            return Ok(None);
        }
        let bytes = match self.blob.read(record.fingerprint, &record.stem, key) {
            Ok((bytes, _)) => bytes,
            Err(CacheError::NotFound) => {
                self.remove_entry(key)?;
                return Ok(None);
            }
            Err(e @ CacheError::CorruptedEntry { .. }) => {
                self.remove_entry(key)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.remove_entry(key)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(bytes))
    }

    /// Update an entry's expiry deadline (absolute; `None` clears it).
    /// Returns `false` when the key is absent or already expired.
    pub fn touch(&self, key: &str, expires_at: Option<u64>) -> CacheResult<bool> {
        validate_key(key)?;
        self.index.refresh()?;
        let now = now_epoch_secs();

        let record = {
            let mut txn = self.index.write_txn()?;
            let Some(record) = txn.lookup(key) else {
                return Ok(false);
            };
            if record.meta.is_expired_at(now) {
                drop(txn);
                self.remove_entry(key)?;
                return Ok(false);
            }
            let mut meta = record.meta.clone();
            meta.expires_at = expires_at.map(|deadline| deadline.max(now));
            txn.touch(key, meta.clone())?;
            IndexRecord {
                meta,
                ..record.clone()
            }
        };

        // Keep the sidecar authoritative for rescans: an expiry change
        // must survive a journal loss.
        if let Some(mut sidecar) = self.blob.read_sidecar(record.fingerprint, &record.stem)? {
            if sidecar.key == key {
                sidecar.meta = record.meta.clone();
                self.blob.write_sidecar(record.fingerprint, &record.stem, &sidecar)?;
            }
        }
        self.memory.update_meta(key, record.meta, true);
        Ok(true)
    }

    /// Remove every entry. Returns how many were live.
    pub fn clear(&self) -> CacheResult<u64> {
        let drained = {
            let mut txn = self.index.write_txn()?;
            txn.clear()?
        };
        for leaf in self.blob.layout().leaf_dirs()? {
            let _ = fs::remove_dir_all(&leaf);
            if let Some(parent) = leaf.parent() {
                // Only succeeds once the last leaf under it is gone.
                let _ = fs::remove_dir(parent);
            }
        }
        self.memory.clear();
        debug!(removed = drained.len(), "cleared cache");
        Ok(drained.len() as u64)
    }

    /// Remove every entry carrying `tag`. One logical operation that
    /// journals an individual DEL per entry.
    pub fn evict_by_tag(&self, tag: &str) -> CacheResult<usize> {
        self.index.refresh()?;
        let tagged: Vec<String> = self
            .live_entries()
            .into_iter()
            .filter(|(_, record)| record.meta.has_tag(tag))
            .map(|(key, _)| key)
            .collect();

        let mut removed = Vec::new();
        {
            let mut txn = self.index.write_txn()?;
            for key in &tagged {
                if let Some(record) = txn.delete(key)? {
                    removed.push((key.clone(), record));
                }
            }
        }
        for (key, record) in &removed {
            self.blob.delete(record.fingerprint, &record.stem)?;
            self.memory.invalidate(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed.len())
    }

    /// Existence check without reading the value and without touching
    /// recency or the stats counters.
    pub fn contains(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        self.index.refresh()?;
        let now = now_epoch_secs();
        Ok(self
            .index
            .lookup(key)
            .map(|record| !record.meta.is_expired_at(now))
            .unwrap_or(false))
    }

    /// Live keys at a point in time. Order is unspecified; entries
    /// written after the call may be missing and entries deleted during
    /// iteration may appear.
    pub fn scan(&self) -> CacheResult<Vec<String>> {
        self.index.refresh()?;
        Ok(self.live_entries().into_iter().map(|(key, _)| key).collect())
    }

    /// Live entry count.
    pub fn len(&self) -> u64 {
        self.live_entries().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate size of live values, in bytes.
    pub fn volume(&self) -> u64 {
        self.live_entries()
            .iter()
            .map(|(_, record)| record.meta.size)
            .sum()
    }

    /// Counter snapshot plus current size/count.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.volume(),
            count: self.len(),
        }
    }

    /// Run one expiration/orphan sweep inline, returning how many
    /// expired entries were removed.
    pub fn expire(&self) -> CacheResult<usize> {
        sweep_once(&self.index, &self.blob, &self.key_locks).map(|stats| stats.expired)
    }

    /// Stop the background sweeper. Further operations still work; a
    /// dropped cache closes itself.
    pub fn close(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config.operation_timeout_seconds)
    }

    fn live_entries(&self) -> Vec<(String, IndexRecord)> {
        let now = now_epoch_secs();
        self.index
            .scan()
            .into_iter()
            .filter(|(_, record)| !record.meta.is_expired_at(now))
            .collect()
    }

    /// The shared write path behind `set`, `add` and `incr`: stage the
    /// blob lock-free, then rename plus journal append inside the
    /// critical section, then memory tier and bounds.
    fn write_entry(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<u64>,
        tags: Vec<String>,
    ) -> CacheResult<EntryMeta> {
        if value.len() as u64 > self.config.max_blob_size {
            return Err(CacheError::CapacityExceeded {
                size: value.len() as u64,
                limit: self.config.max_blob_size,
            });
        }
        let now = now_epoch_secs();
        let expires_at = expires_at.map(|deadline| deadline.max(now));

        let fp = fingerprint(key);
        let stem = self.blob.resolve_stem_for_write(fp, key)?;
        let staged = self.blob.stage(fp, &stem, value)?;

        let meta = EntryMeta::new(value.len() as u64, expires_at, tags);
        let sidecar = Sidecar {
            key: key.to_string(),
            blob_crc: staged.crc,
            meta: meta.clone(),
        };

        let value_seq = {
            let mut txn = self.index.write_txn()?;
            self.blob.commit(fp, &stem, staged, &sidecar)?;
            txn.put(key, &stem, meta.clone())?
        };

        self.memory
            .insert(key, Arc::new(value.to_vec()), meta.clone(), value_seq);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.enforce_bounds(Some(key))?;
        Ok(meta)
    }

    /// Synchronous eviction until both bounds hold with headroom.
    ///
    /// `protect` shields the key whose write triggered the pass: with
    /// second-granularity recency a fresh write can tie with old
    /// entries, and the write that just succeeded must not evict
    /// itself. Entries that stay write-locked across all passes are
    /// skipped; they are mid-mutation and about to change anyway.
    fn enforce_bounds(&self, protect: Option<&str>) -> CacheResult<()> {
        if self.config.eviction_policy == EvictionPolicy::None {
            return Ok(());
        }
        for _ in 0..EVICTION_PASSES {
            let live = self.live_entries();
            let bytes: u64 = live.iter().map(|(_, record)| record.meta.size).sum();
            let count = live.len() as u64;
            if bytes <= self.config.max_size && count <= self.config.max_entries {
                return Ok(());
            }

            let victims = select_victims(
                self.config.eviction_policy,
                live,
                bytes,
                count,
                self.config.size_low_water(),
                self.config.entries_low_water(),
            );
            if victims.is_empty() {
                return Ok(());
            }

            let mut evicted = 0usize;
            for (key, _) in victims {
                if protect == Some(key.as_str()) {
                    continue;
                }
                let Some(_guard) = self.key_locks.try_acquire(&key) else {
                    continue;
                };
                let removed = {
                    let mut txn = self.index.write_txn()?;
                    txn.delete(&key)?
                };
                if let Some(record) = removed {
                    self.blob.delete(record.fingerprint, &record.stem)?;
                    self.memory.invalidate(&key);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted += 1;
                }
            }
            debug!(evicted, "eviction pass complete");
            if evicted == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Delete an entry's journal record, files and memory-tier copy.
    fn remove_entry(&self, key: &str) -> CacheResult<bool> {
        let removed = {
            let mut txn = self.index.write_txn()?;
            txn.delete(key)?
        };
        self.memory.invalidate(key);
        match removed {
            Some(record) => {
                self.blob.delete(record.fingerprint, &record.stem)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.close();
    }
}
