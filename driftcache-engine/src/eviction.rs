use driftcache_core::EvictionPolicy;
use driftcache_storage::IndexRecord;

/// Order victim candidates for a policy and take just enough of them to
/// bring both measures down to their targets.
///
/// Ties break by oldest `last_accessed_at`, then lowest fingerprint,
/// so the outcome is deterministic for a given on-disk state.
pub fn select_victims(
    policy: EvictionPolicy,
    mut candidates: Vec<(String, IndexRecord)>,
    current_bytes: u64,
    current_count: u64,
    target_bytes: u64,
    target_count: u64,
) -> Vec<(String, IndexRecord)> {
    if policy == EvictionPolicy::None {
        return Vec::new();
    }
    if current_bytes <= target_bytes && current_count <= target_count {
        return Vec::new();
    }

    candidates.sort_by(|(_, a), (_, b)| {
        policy_rank(policy, a)
            .cmp(&policy_rank(policy, b))
            .then(a.meta.last_accessed_at.cmp(&b.meta.last_accessed_at))
            .then(a.fingerprint.cmp(&b.fingerprint))
    });

    let mut bytes = current_bytes;
    let mut count = current_count;
    let mut victims = Vec::new();
    for (key, record) in candidates {
        if bytes <= target_bytes && count <= target_count {
            break;
        }
        bytes = bytes.saturating_sub(record.meta.size);
        count = count.saturating_sub(1);
        victims.push((key, record));
    }
    victims
}

/// The value a policy sorts ascending by; smaller means evicted sooner.
fn policy_rank(policy: EvictionPolicy, record: &IndexRecord) -> u64 {
    match policy {
        EvictionPolicy::Lru => record.meta.last_accessed_at,
        EvictionPolicy::Lfu => record.meta.access_count,
        EvictionPolicy::Fifo => record.meta.created_at,
        // Soonest-expiring first; entries that never expire go last.
        EvictionPolicy::TtlAscending => record.meta.expires_at.unwrap_or(u64::MAX),
        EvictionPolicy::None => 0,
    }
}
