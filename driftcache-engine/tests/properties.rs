//! Property-based round-trip laws, run against a real directory.

use driftcache_core::CacheConfig;
use driftcache_engine::Cache;
use proptest::prelude::*;

fn quiet_config() -> CacheConfig {
    CacheConfig {
        sweep_interval_seconds: 0,
        ..CacheConfig::default()
    }
}

proptest! {
    // Each case touches the filesystem; keep the case count sane.
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn set_get_round_trips_arbitrary_bytes(value in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(dir.path(), quiet_config()).unwrap();
        cache.set("k", &value).unwrap();
        prop_assert_eq!(cache.get("k").unwrap().unwrap(), value);
    }

    #[test]
    fn delete_makes_any_value_absent(value in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(dir.path(), quiet_config()).unwrap();
        cache.set("k", &value).unwrap();
        prop_assert!(cache.delete("k").unwrap());
        prop_assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn last_write_wins(values in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 1..8)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(dir.path(), quiet_config()).unwrap();
        for value in &values {
            cache.set("k", value).unwrap();
        }
        prop_assert_eq!(cache.get("k").unwrap().unwrap(), values.last().unwrap().clone());
        prop_assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unicode_keys_round_trip(key in "[\\p{L}\\p{N} _./:-]{1,64}", value in proptest::collection::vec(any::<u8>(), 0..512)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(dir.path(), quiet_config()).unwrap();
        cache.set(&key, &value).unwrap();
        prop_assert_eq!(cache.get(&key).unwrap().unwrap(), value);
        prop_assert!(cache.scan().unwrap().contains(&key));
    }

    #[test]
    fn counter_arithmetic_matches_i64(start in any::<i64>(), deltas in proptest::collection::vec(-1000i64..1000, 0..6)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_with(dir.path(), quiet_config()).unwrap();
        cache.set("n", &start.to_le_bytes()).unwrap();
        let mut expected = start;
        for delta in deltas {
            expected = expected.wrapping_add(delta);
            prop_assert_eq!(cache.incr("n", delta).unwrap(), expected);
        }
    }
}
