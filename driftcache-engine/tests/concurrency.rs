//! Multi-threaded behavior of a single cache instance.

use std::sync::Arc;

use driftcache_core::CacheConfig;
use driftcache_engine::Cache;

fn open_cache(dir: &std::path::Path) -> Arc<Cache> {
    let config = CacheConfig {
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    };
    Arc::new(Cache::open_with(dir, config).unwrap())
}

#[test]
fn concurrent_increments_never_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    cache.set("counter", &0i64.to_le_bytes()).unwrap();

    const THREADS: usize = 8;
    const PER_THREAD: i64 = 250;

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..PER_THREAD {
                    cache.incr("counter", 1).unwrap();
                }
            });
        }
    });

    let expected = (THREADS as i64) * PER_THREAD;
    assert_eq!(
        cache.get("counter").unwrap().unwrap(),
        expected.to_le_bytes().to_vec()
    );
}

#[test]
fn concurrent_writers_to_one_key_leave_one_whole_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    const WRITERS: usize = 4;
    const ROUNDS: usize = 20;

    std::thread::scope(|scope| {
        for w in 0..WRITERS {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                // Each writer's values are self-describing: byte w
                // repeated, so a torn mix is detectable.
                let value = vec![w as u8; 512];
                for _ in 0..ROUNDS {
                    cache.set("contested", &value).unwrap();
                }
            });
        }
    });

    let value = cache.get("contested").unwrap().unwrap();
    assert_eq!(value.len(), 512);
    let first = value[0];
    assert!((first as usize) < WRITERS);
    assert!(value.iter().all(|&b| b == first), "value bytes were mixed");
}

#[test]
fn readers_and_writers_on_disjoint_keys_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    for n in 0..8 {
        cache.set(&format!("seed-{n}"), &[n as u8; 32]).unwrap();
    }

    std::thread::scope(|scope| {
        for n in 0..4usize {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for round in 0..50u8 {
                    let key = format!("writer-{n}-{round}");
                    cache.set(&key, &[round; 16]).unwrap();
                    assert_eq!(cache.get(&key).unwrap().unwrap(), vec![round; 16]);
                }
            });
        }
        for n in 0..4usize {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for _ in 0..50 {
                    let key = format!("seed-{}", n % 8);
                    let value = cache.get(&key).unwrap().unwrap();
                    assert_eq!(value, vec![(n % 8) as u8; 32]);
                }
            });
        }
    });
}

#[test]
fn pop_hands_each_value_to_exactly_one_thread() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    for n in 0..32 {
        cache.set(&format!("job-{n:02}"), &[n as u8]).unwrap();
    }

    let claimed: Vec<Vec<String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    let mut got = Vec::new();
                    for n in 0..32 {
                        let key = format!("job-{n:02}");
                        if cache.pop(&key).unwrap().is_some() {
                            got.push(key);
                        }
                    }
                    got
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<String> = claimed.into_iter().flatten().collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 32, "every job claimed exactly once");
    assert_eq!(cache.len(), 0);
}

#[test]
fn same_second_equal_size_overwrite_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let a = open_cache(dir.path());
    let b = open_cache(dir.path());

    // Seed instance A's memory tier with its own write.
    a.set("k", b"aaaa").unwrap();
    assert_eq!(a.get("k").unwrap().as_deref(), Some(&b"aaaa"[..]));

    // Instance B overwrites within the same wall-clock second with a
    // value of identical length, so creation time and size alone
    // cannot distinguish old bytes from new.
    b.set("k", b"bbbb").unwrap();
    assert_eq!(
        a.get("k").unwrap().as_deref(),
        Some(&b"bbbb"[..]),
        "a get after a completed set must observe that set"
    );

    // And again, twice in a row, to rule out ABA on the second write.
    b.set("k", b"cccc").unwrap();
    b.set("k", b"dddd").unwrap();
    assert_eq!(a.get("k").unwrap().as_deref(), Some(&b"dddd"[..]));
}

#[test]
fn two_instances_on_one_directory_stay_coherent() {
    let dir = tempfile::tempdir().unwrap();
    let writer = open_cache(dir.path());
    let reader = open_cache(dir.path());

    writer.set("shared", b"from writer").unwrap();
    assert_eq!(
        reader.get("shared").unwrap().as_deref(),
        Some(&b"from writer"[..])
    );

    writer.delete("shared").unwrap();
    assert_eq!(reader.get("shared").unwrap(), None);

    // And the other direction.
    reader.set("reply", b"from reader").unwrap();
    assert_eq!(
        writer.get("reply").unwrap().as_deref(),
        Some(&b"from reader"[..])
    );
}
