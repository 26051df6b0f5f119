use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use driftcache_core::{now_epoch_secs, EntryMeta, MemoryTierConfig};

/// A memory-tier hit: the resident value plus the metadata and the
/// journal sequence of the write it was cached from.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub value: Arc<Vec<u8>>,
    pub meta: EntryMeta,
    /// `value_seq` of the PUT whose bytes these are; compared against
    /// the index to prove the copy is still current.
    pub value_seq: u64,
}

#[derive(Debug)]
struct ResidentEntry {
    value: Arc<Vec<u8>>,
    meta: EntryMeta,
    value_seq: u64,
    /// When the entry became resident; drives the soft TTL.
    resident_since: u64,
}

#[derive(Debug)]
struct TierState {
    entries: LruCache<String, ResidentEntry>,
    bytes: u64,
}

/// Bounded in-process cache of recently used entries.
///
/// Strictly a latency aid: it never owns an entry's liveness, and a
/// disabled tier (any bound set to zero) changes nothing observable
/// except speed. Values are shared `Arc`s, so evicting from here never
/// copies or destroys anything on disk.
#[derive(Debug)]
pub struct MemoryTier {
    state: Mutex<TierState>,
    config: MemoryTierConfig,
    enabled: bool,
}

impl MemoryTier {
    pub fn new(config: MemoryTierConfig) -> Self {
        let enabled = config.max_entries > 0 && config.max_bytes > 0;
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            state: Mutex::new(TierState {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
            config,
            enabled,
        }
    }

    /// Look up a resident entry, refreshing its recency. Entries past
    /// their soft TTL or their own expiry are dropped, not returned.
    pub fn get(&self, key: &str, now: u64) -> Option<MemoryHit> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.lock();
        let hit = match state.entries.get(key) {
            None => return None,
            Some(entry) => {
                let soft_ttl = self.config.ttl_seconds;
                let stale = (soft_ttl > 0
                    && now.saturating_sub(entry.resident_since) >= soft_ttl)
                    || entry.meta.is_expired_at(now);
                if stale {
                    None
                } else {
                    Some(MemoryHit {
                        value: Arc::clone(&entry.value),
                        meta: entry.meta.clone(),
                        value_seq: entry.value_seq,
                    })
                }
            }
        };
        if hit.is_none() {
            remove(&mut state, key);
        }
        hit
    }

    /// Make an entry resident, evicting the least recently used ones
    /// until both bounds hold. Values bigger than the byte bound are
    /// simply not cached.
    pub fn insert(&self, key: &str, value: Arc<Vec<u8>>, meta: EntryMeta, value_seq: u64) {
        if !self.enabled || value.len() as u64 > self.config.max_bytes {
            return;
        }
        let mut state = self.state.lock();
        remove(&mut state, key);
        state.bytes += value.len() as u64;
        if let Some((_, displaced)) = state.entries.push(
            key.to_string(),
            ResidentEntry {
                value,
                meta,
                value_seq,
                resident_since: now_epoch_secs(),
            },
        ) {
            state.bytes = state.bytes.saturating_sub(displaced.value.len() as u64);
        }
        while state.bytes > self.config.max_bytes {
            match state.entries.pop_lru() {
                Some((_, dropped)) => {
                    state.bytes = state.bytes.saturating_sub(dropped.value.len() as u64);
                }
                None => break,
            }
        }
    }

    /// Replace a resident entry's metadata. `refresh_ttl` restarts the
    /// soft TTL clock, which is what `touch` wants.
    pub fn update_meta(&self, key: &str, meta: EntryMeta, refresh_ttl: bool) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.peek_mut(key) {
            entry.meta = meta;
            if refresh_ttl {
                entry.resident_since = now_epoch_secs();
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        if !self.enabled {
            return;
        }
        remove(&mut self.state.lock(), key);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }

    #[cfg(test)]
    pub(crate) fn resident_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn resident_bytes(&self) -> u64 {
        self.state.lock().bytes
    }
}

fn remove(state: &mut TierState, key: &str) {
    if let Some(entry) = state.entries.pop(key) {
        state.bytes = state.bytes.saturating_sub(entry.value.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max_entries: usize, max_bytes: u64, ttl: u64) -> MemoryTier {
        MemoryTier::new(MemoryTierConfig {
            max_entries,
            max_bytes,
            ttl_seconds: ttl,
        })
    }

    fn meta(size: u64) -> EntryMeta {
        EntryMeta::new(size, None, Vec::new())
    }

    #[test]
    fn hit_and_miss() {
        let tier = tier(10, 1024, 300);
        let now = now_epoch_secs();
        assert!(tier.get("k", now).is_none());
        tier.insert("k", Arc::new(b"value".to_vec()), meta(5), 1);
        let hit = tier.get("k", now).unwrap();
        assert_eq!(*hit.value, b"value".to_vec());
        assert_eq!(hit.value_seq, 1);
    }

    #[test]
    fn entry_count_bound_evicts_lru() {
        let tier = tier(2, 1024, 300);
        let now = now_epoch_secs();
        tier.insert("a", Arc::new(vec![1]), meta(1), 1);
        tier.insert("b", Arc::new(vec![2]), meta(1), 2);
        tier.get("a", now); // freshen "a" so "b" is the LRU victim
        tier.insert("c", Arc::new(vec![3]), meta(1), 3);

        assert!(tier.get("a", now).is_some());
        assert!(tier.get("b", now).is_none());
        assert!(tier.get("c", now).is_some());
        assert_eq!(tier.resident_count(), 2);
    }

    #[test]
    fn byte_bound_evicts_until_it_fits() {
        let tier = tier(100, 10, 300);
        tier.insert("a", Arc::new(vec![0; 6]), meta(6), 1);
        tier.insert("b", Arc::new(vec![0; 6]), meta(6), 2);
        assert!(tier.resident_bytes() <= 10);
        assert_eq!(tier.resident_count(), 1);
    }

    #[test]
    fn oversized_values_are_not_cached() {
        let tier = tier(100, 10, 300);
        tier.insert("big", Arc::new(vec![0; 11]), meta(11), 1);
        assert_eq!(tier.resident_count(), 0);
    }

    #[test]
    fn soft_ttl_expires_residents() {
        let tier = tier(10, 1024, 5);
        let now = now_epoch_secs();
        tier.insert("k", Arc::new(vec![1]), meta(1), 1);
        assert!(tier.get("k", now).is_some());
        assert!(tier.get("k", now + 5).is_none());
        assert_eq!(tier.resident_count(), 0);
    }

    #[test]
    fn entry_expiry_is_honored() {
        let tier = tier(10, 1024, 300);
        let now = now_epoch_secs();
        let expiring = EntryMeta::new(1, Some(now + 2), Vec::new());
        tier.insert("k", Arc::new(vec![1]), expiring, 1);
        assert!(tier.get("k", now).is_some());
        assert!(tier.get("k", now + 2).is_none());
    }

    #[test]
    fn touch_refreshes_the_soft_ttl() {
        let tier = tier(10, 1024, 300);
        let now = now_epoch_secs();
        tier.insert("k", Arc::new(vec![1]), meta(1), 1);
        let mut updated = meta(1);
        updated.expires_at = Some(now + 9000);
        tier.update_meta("k", updated.clone(), true);
        let hit = tier.get("k", now).unwrap();
        assert_eq!(hit.meta.expires_at, Some(now + 9000));
    }

    #[test]
    fn disabled_tier_caches_nothing() {
        let tier = tier(0, 1024, 300);
        tier.insert("k", Arc::new(vec![1]), meta(1), 1);
        assert!(tier.get("k", now_epoch_secs()).is_none());
    }

    #[test]
    fn invalidate_and_clear() {
        let tier = tier(10, 1024, 300);
        let now = now_epoch_secs();
        tier.insert("a", Arc::new(vec![1]), meta(1), 1);
        tier.insert("b", Arc::new(vec![2]), meta(1), 2);
        tier.invalidate("a");
        assert!(tier.get("a", now).is_none());
        assert!(tier.get("b", now).is_some());
        tier.clear();
        assert_eq!(tier.resident_count(), 0);
        assert_eq!(tier.resident_bytes(), 0);
    }
}
