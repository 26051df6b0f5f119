use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use driftcache_core::{now_epoch_secs, CacheResult};

use crate::blob::{BlobStore, Sidecar};
use crate::index::Index;
use crate::layout::ShardLayout;
use crate::lock::{is_lock_artifact, KeyLocks};

/// Age before a stray file (staging temp, half-committed pair, orphan
/// sidecar) is considered abandoned rather than in flight.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(600);

/// What one sweep pass reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed because their expiry deadline passed.
    pub expired: usize,
    /// Value files without a sidecar.
    pub orphan_bins: usize,
    /// Sidecars without a value file, or undecodable ones.
    pub orphan_metas: usize,
    /// Abandoned staging temp files.
    pub temp_files: usize,
    /// Complete pairs the index never acknowledged.
    pub unindexed_pairs: usize,
}

impl SweepStats {
    pub fn reclaimed_anything(&self) -> bool {
        *self != SweepStats::default()
    }
}

/// One synchronous sweep: expiration first, then orphan reclamation.
/// Also what the facade's `expire()` runs inline.
pub fn sweep_once(index: &Index, blob: &BlobStore, key_locks: &KeyLocks) -> CacheResult<SweepStats> {
    sweep_once_with_grace(index, blob, key_locks, ORPHAN_GRACE)
}

pub fn sweep_once_with_grace(
    index: &Index,
    blob: &BlobStore,
    key_locks: &KeyLocks,
    grace: Duration,
) -> CacheResult<SweepStats> {
    let mut stats = SweepStats::default();
    index.refresh()?;

    let now = now_epoch_secs();
    for (key, _) in index
        .scan()
        .into_iter()
        .filter(|(_, record)| record.meta.is_expired_at(now))
    {
        // Writers win: an entry someone is mutating is skipped and
        // picked up on the next pass.
        let Some(_guard) = key_locks.try_acquire(&key) else {
            continue;
        };
        let mut txn = index.write_txn()?;
        // Re-check under the lock; the entry may have been replaced.
        let still_expired = txn
            .lookup(&key)
            .map(|record| record.meta.is_expired_at(now))
            .unwrap_or(false);
        if !still_expired {
            continue;
        }
        if let Some(removed) = txn.delete(&key)? {
            drop(txn);
            blob.delete(removed.fingerprint, &removed.stem)?;
            stats.expired += 1;
        }
    }

    sweep_orphans(index, blob, grace, &mut stats)?;
    key_locks.gc();

    if stats.reclaimed_anything() {
        info!(?stats, "sweep pass reclaimed files");
    } else {
        debug!("sweep pass found nothing to reclaim");
    }
    Ok(stats)
}

fn sweep_orphans(
    index: &Index,
    blob: &BlobStore,
    grace: Duration,
    stats: &mut SweepStats,
) -> CacheResult<()> {
    for leaf in blob.layout().leaf_dirs()? {
        for entry in fs::read_dir(&leaf)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str().map(str::to_string) else {
                continue;
            };
            let path = entry.path();
            if is_lock_artifact(&name) || !aged_out(&path, grace) {
                continue;
            }

            if ShardLayout::is_temp_name(&name) {
                if fs::remove_file(&path).is_ok() {
                    stats.temp_files += 1;
                }
            } else if let Some(stem) = name.strip_suffix(".meta") {
                reclaim_meta(index, &leaf, &path, stem, stats);
            } else if let Some(stem) = name.strip_suffix(".bin") {
                // A value whose sidecar never landed is unreadable
                // (no checksum, no key) and therefore garbage.
                if !leaf.join(format!("{stem}.meta")).exists() && fs::remove_file(&path).is_ok() {
                    stats.orphan_bins += 1;
                }
            }
        }
    }
    Ok(())
}

/// Decide what a sidecar past the grace age is: orphaned (no value
/// file), unacknowledged (index never heard of its key), or live.
fn reclaim_meta(index: &Index, leaf: &Path, path: &Path, stem: &str, stats: &mut SweepStats) {
    let bin = leaf.join(format!("{stem}.bin"));
    if !bin.exists() {
        if fs::remove_file(path).is_ok() {
            stats.orphan_metas += 1;
        }
        return;
    }
    let sidecar = fs::read(path).ok().and_then(|buf| Sidecar::decode(&buf).ok());
    match sidecar {
        None => {
            // Unreadable sidecar makes the pair unreadable.
            if fs::remove_file(path).is_ok() {
                stats.orphan_metas += 1;
            }
            let _ = fs::remove_file(&bin);
        }
        Some(sidecar) => {
            if index.lookup(&sidecar.key).is_none() {
                // A pair whose write was never acknowledged: the crash
                // happened between the rename and the journal append.
                if fs::remove_file(&bin).is_ok() {
                    let _ = fs::remove_file(path);
                    stats.unindexed_pairs += 1;
                }
            }
        }
    }
}

fn aged_out(path: &Path, grace: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= grace)
        .unwrap_or(false)
}

/// Cooperative background thread running [`sweep_once`] on a cadence.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(
        interval: Duration,
        index: Arc<Index>,
        blob: Arc<BlobStore>,
        key_locks: Arc<KeyLocks>,
    ) -> CacheResult<Sweeper> {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("driftcache-sweeper".into())
            .spawn(move || loop {
                {
                    let (flag, condvar) = &*thread_shutdown;
                    let mut stop = flag.lock();
                    if !*stop {
                        condvar.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }
                if let Err(e) = sweep_once(&index, &blob, &key_locks) {
                    warn!(error = %e, "background sweep failed");
                }
            })?;
        info!(?interval, "started background sweeper");
        Ok(Sweeper {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Wake the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (flag, condvar) = &*self.shutdown;
            *flag.lock() = true;
            condvar.notify_all();
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
