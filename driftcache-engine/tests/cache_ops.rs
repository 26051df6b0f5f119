//! End-to-end coverage of the cache facade over a scratch directory.

use driftcache_core::{now_epoch_secs, CacheConfig, CacheError, EvictionPolicy, MemoryTierConfig};
use driftcache_engine::Cache;

fn quiet_config() -> CacheConfig {
    // No background sweeper: tests drive expiration explicitly.
    CacheConfig {
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    }
}

fn open_cache(dir: &std::path::Path) -> Cache {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Cache::open_with(dir, quiet_config()).unwrap()
}

#[test]
fn set_then_get_round_trips_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.set("hello", b"world").unwrap();
    assert_eq!(cache.get("hello").unwrap().as_deref(), Some(&b"world"[..]));

    let stats = cache.stats();
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.count, 1);
    assert_eq!(stats.size, 5);
}

#[test]
fn get_of_absent_key_is_none_and_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    assert_eq!(cache.get("nothing").unwrap(), None);
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn empty_and_binary_values_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    cache.set("empty", b"").unwrap();
    assert_eq!(cache.get("empty").unwrap().as_deref(), Some(&b""[..]));

    let binary: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    cache.set("binary", &binary).unwrap();
    assert_eq!(cache.get("binary").unwrap().unwrap(), binary);
}

#[test]
fn overwrite_replaces_the_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("k", b"first").unwrap();
    cache.set("k", b"second").unwrap();
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"second"[..]));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.volume(), 6);
}

#[test]
fn delete_reports_presence() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("k", b"v").unwrap();
    assert!(cache.delete("k").unwrap());
    assert_eq!(cache.get("k").unwrap(), None);
    assert!(!cache.delete("k").unwrap());
    assert_eq!(cache.stats().deletes, 1);
}

#[test]
fn add_keeps_the_first_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.add("k", b"v1").unwrap();
    assert!(matches!(
        cache.add("k", b"v2"),
        Err(CacheError::AlreadyPresent)
    ));
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"v1"[..]));
}

#[test]
fn add_overwrites_an_expired_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache
        .set_with("k", b"old", Some(now_epoch_secs().saturating_sub(10)), &[])
        .unwrap();
    cache.add("k", b"new").unwrap();
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"new"[..]));
}

#[test]
fn incr_creates_from_zero_and_counts_up() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    assert_eq!(cache.incr("counter", 5).unwrap(), 5);
    assert_eq!(cache.incr("counter", 3).unwrap(), 8);
    assert_eq!(cache.decr("counter", 10).unwrap(), -2);
    assert_eq!(
        cache.get("counter").unwrap().unwrap(),
        (-2i64).to_le_bytes().to_vec()
    );
}

#[test]
fn incr_on_non_counter_payload_is_a_type_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("text", b"not a counter").unwrap();
    assert!(matches!(
        cache.incr("text", 1),
        Err(CacheError::TypeMismatch { len: 13 })
    ));
    // The payload is untouched.
    assert_eq!(
        cache.get("text").unwrap().as_deref(),
        Some(&b"not a counter"[..])
    );
}

#[test]
fn pop_reads_and_deletes_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("k", b"payload").unwrap();
    assert_eq!(cache.pop("k").unwrap().as_deref(), Some(&b"payload"[..]));
    assert_eq!(cache.pop("k").unwrap(), None);
    assert_eq!(cache.get("k").unwrap(), None);
}

#[test]
fn expired_entries_read_as_absent_and_self_delete() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache
        .set_with("gone", b"v", Some(now_epoch_secs().saturating_sub(5)), &[])
        .unwrap();
    assert_eq!(cache.get("gone").unwrap(), None);
    // The expired entry was removed on access, not just hidden.
    assert!(!cache.contains("gone").unwrap());
    assert_eq!(cache.len(), 0);
}

#[test]
fn touch_extends_and_clears_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let soon = now_epoch_secs() + 2;
    cache.set_with("k", b"v", Some(soon), &[]).unwrap();

    // Push the deadline out, then clear it entirely.
    assert!(cache.touch("k", Some(now_epoch_secs() + 3600)).unwrap());
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    assert!(cache.touch("k", None).unwrap());
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"v"[..]));

    assert!(!cache.touch("missing", None).unwrap());
}

#[test]
fn touch_with_a_past_deadline_expires_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("k", b"v").unwrap();
    assert!(cache.touch("k", Some(1)).unwrap());
    assert_eq!(cache.get("k").unwrap(), None);
}

#[test]
fn clear_empties_everything() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    for n in 0..20 {
        cache.set(&format!("key-{n}"), &vec![n as u8; 64]).unwrap();
    }
    assert_eq!(cache.clear().unwrap(), 20);
    assert!(cache.scan().unwrap().is_empty());
    assert_eq!(cache.volume(), 0);
    assert_eq!(cache.len(), 0);
    // The cache stays usable afterwards.
    cache.set("after", b"clear").unwrap();
    assert_eq!(cache.get("after").unwrap().as_deref(), Some(&b"clear"[..]));
}

#[test]
fn scan_lists_live_keys_only() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("a", b"1").unwrap();
    cache.set("b", b"2").unwrap();
    cache
        .set_with("expired", b"3", Some(now_epoch_secs().saturating_sub(1)), &[])
        .unwrap();

    let mut keys = cache.scan().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn scan_volume_agreement() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    for n in 0..10u8 {
        cache.set(&format!("k{n}"), &vec![0; (n as usize + 1) * 10]).unwrap();
    }
    let summed: u64 = cache
        .scan()
        .unwrap()
        .iter()
        .map(|k| cache.get(k).unwrap().unwrap().len() as u64)
        .sum();
    assert_eq!(summed, cache.volume());
}

#[test]
fn values_above_the_blob_ceiling_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        max_blob_size: 1024,
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    };
    let cache = Cache::open_with(dir.path(), config).unwrap();
    assert!(matches!(
        cache.set("big", &vec![0u8; 2048]),
        Err(CacheError::CapacityExceeded { size: 2048, limit: 1024 })
    ));
    assert_eq!(cache.get("big").unwrap(), None);
}

#[test]
fn keys_and_tags_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    assert!(matches!(cache.set("", b"v"), Err(CacheError::InvalidKey { .. })));
    assert!(matches!(
        cache.set(&"x".repeat(1025), b"v"),
        Err(CacheError::InvalidKey { .. })
    ));
    assert!(matches!(
        cache.set_with("k", b"v", None, &["this tag is far too long".into()]),
        Err(CacheError::InvalidKey { .. })
    ));
}

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = open_cache(dir.path());
        cache.set("persisted", b"across reopen").unwrap();
        cache
            .set_with("tagged", b"x", None, &["session".into()])
            .unwrap();
        cache.close();
    }
    let cache = open_cache(dir.path());
    assert_eq!(
        cache.get("persisted").unwrap().as_deref(),
        Some(&b"across reopen"[..])
    );
    assert_eq!(cache.len(), 2);
    // Stats are process-local and reset on reopen.
    assert_eq!(cache.stats().sets, 0);
}

#[test]
fn stats_reset_on_reopen_but_entries_do_not() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = open_cache(dir.path());
        cache.set("k", b"v").unwrap();
        cache.get("k").unwrap();
        assert_eq!(cache.stats().hits, 1);
    }
    let cache = open_cache(dir.path());
    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.sets, 0);
    assert_eq!(stats.count, 1);
}

#[test]
fn memory_tier_disabled_changes_nothing_observable() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        memory_tier: MemoryTierConfig {
            max_entries: 0,
            max_bytes: 0,
            ttl_seconds: 0,
        },
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    };
    let cache = Cache::open_with(dir.path(), config).unwrap();
    cache.set("k", b"no memory tier").unwrap();
    assert_eq!(
        cache.get("k").unwrap().as_deref(),
        Some(&b"no memory tier"[..])
    );
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"no memory tier"[..]));
    assert!(cache.delete("k").unwrap());
    assert_eq!(cache.get("k").unwrap(), None);
}

#[test]
fn corrupted_value_errors_once_then_reads_absent() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        memory_tier: MemoryTierConfig {
            max_entries: 0,
            max_bytes: 0,
            ttl_seconds: 0,
        },
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    };
    let cache = Cache::open_with(dir.path(), config).unwrap();
    cache.set("k", b"pristine").unwrap();

    // Corrupt the value file behind the cache's back.
    let mut bin_path = None;
    for entry in walk_files(dir.path()) {
        if entry.extension().map(|e| e == "bin").unwrap_or(false) {
            bin_path = Some(entry);
        }
    }
    let bin_path = bin_path.expect("one value file on disk");
    let mut bytes = std::fs::read(&bin_path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&bin_path, bytes).unwrap();

    assert!(matches!(
        cache.get("k"),
        Err(CacheError::CorruptedEntry { .. })
    ));
    // Self-healed: the entry is gone now.
    assert_eq!(cache.get("k").unwrap(), None);
}

#[test]
fn eviction_policy_none_allows_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        max_size: 100,
        max_blob_size: 100,
        eviction_policy: EvictionPolicy::None,
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    };
    let cache = Cache::open_with(dir.path(), config).unwrap();
    for n in 0..5 {
        cache.set(&format!("k{n}"), &[0u8; 50]).unwrap();
    }
    assert_eq!(cache.len(), 5);
    assert!(cache.volume() > 100);
}

fn walk_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
