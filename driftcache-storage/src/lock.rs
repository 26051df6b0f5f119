use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use rand::Rng;
use tracing::{debug, warn};

use driftcache_core::{now_epoch_secs, CacheError, CacheResult};

use crate::probe::FsProfile;

pub const LOCK_FILE_NAME: &str = "index.lock";

/// How long a published lease claim stays valid before any other
/// process may steal it. Generous relative to how briefly the lock is
/// actually held (one journal append), so stealing only happens after
/// a crash.
const LEASE_SECONDS: u64 = 120;

/// Guard for one key's write lock.
pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// Cross-process mutual exclusion over the index journal.
///
/// Two modes, picked by the filesystem probe:
///
/// - **Advisory**: `fs2` exclusive lock on `index.lock`. Correct and
///   cheap wherever the OS honors advisory byte-range locks.
/// - **Lease**: network mounts routinely mishandle advisory locks, so
///   there the lock is a claim file published by rename. A claim name
///   carries `deadline-pid-bootid` and sorts by deadline; the earliest
///   unexpired claim owns the lock, and claims past their deadline are
///   stealable by anyone.
#[derive(Debug)]
pub struct InterProcessLock {
    root: PathBuf,
    use_lease: bool,
}

/// Held inter-process lock; releasing is dropping.
#[derive(Debug)]
pub enum IpGuard {
    Advisory(File),
    Lease { claim: PathBuf },
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        match self {
            IpGuard::Advisory(file) => {
                let _ = file.unlock();
            }
            IpGuard::Lease { claim } => {
                let _ = fs::remove_file(&claim);
            }
        }
    }
}

impl InterProcessLock {
    pub fn new(root: impl Into<PathBuf>, profile: FsProfile) -> Self {
        Self {
            root: root.into(),
            use_lease: profile.is_network,
        }
    }

    /// Block until the lock is held or `timeout` elapses.
    pub fn acquire(&self, timeout: Duration) -> CacheResult<IpGuard> {
        if self.use_lease {
            self.acquire_lease(timeout)
        } else {
            self.acquire_advisory(timeout)
        }
    }

    fn acquire_advisory(&self, timeout: Duration) -> CacheResult<IpGuard> {
        let started = Instant::now();
        let path = self.root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(IpGuard::Advisory(file)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    // Advisory locking is broken on this mount; the
                    // lease protocol still works.
                    warn!(error = %e, "advisory lock unavailable, using lease protocol");
                    return self.acquire_lease(remaining(started, timeout)?);
                }
            }
            sleep_with_jitter();
            if started.elapsed() >= timeout {
                return Err(CacheError::Timeout {
                    op: "index lock",
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn acquire_lease(&self, timeout: Duration) -> CacheResult<IpGuard> {
        let started = Instant::now();
        loop {
            let now = now_epoch_secs();
            let mut live = Vec::new();
            for (path, deadline) in self.list_claims()? {
                if deadline < now {
                    // Stale claim from a dead process: steal it.
                    warn!(claim = %path.display(), "removing stale lock claim");
                    let _ = fs::remove_file(&path);
                } else {
                    live.push(path);
                }
            }

            if live.is_empty() {
                let claim = self.publish_claim(now + LEASE_SECONDS)?;
                // Another process may have published concurrently; the
                // lexicographically first unexpired claim wins.
                let mut contenders: Vec<PathBuf> = self
                    .list_claims()?
                    .into_iter()
                    .filter(|(_, deadline)| *deadline >= now)
                    .map(|(path, _)| path)
                    .collect();
                contenders.sort();
                if contenders.first() == Some(&claim) {
                    debug!(claim = %claim.display(), "acquired lease lock");
                    return Ok(IpGuard::Lease { claim });
                }
                let _ = fs::remove_file(&claim);
            }

            sleep_with_jitter();
            if started.elapsed() >= timeout {
                return Err(CacheError::Timeout {
                    op: "index lock",
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Publish a claim by writing a temp file and renaming it to its
    /// final name, so other observers only ever see a complete claim.
    fn publish_claim(&self, deadline: u64) -> CacheResult<PathBuf> {
        let name = format!(
            "{LOCK_FILE_NAME}.{deadline:020}-{}-{}",
            std::process::id(),
            boot_token(),
        );
        let claim = self.root.join(name);
        let mut temp = tempfile::Builder::new()
            .prefix("claim.tmp.")
            .tempfile_in(&self.root)?;
        temp.write_all(b"driftcache lease claim")?;
        temp.persist(&claim)
            .map_err(|e| CacheError::IOError(e.error))?;
        Ok(claim)
    }

    /// Claim files under the root with their parsed deadlines.
    fn list_claims(&self) -> CacheResult<Vec<(PathBuf, u64)>> {
        let mut claims = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&format!("{LOCK_FILE_NAME}.")) else {
                continue;
            };
            let deadline = rest
                .split('-')
                .next()
                .and_then(|d| d.parse::<u64>().ok())
                // A claim we cannot parse is treated as already stale.
                .unwrap_or(0);
            claims.push((entry.path(), deadline));
        }
        Ok(claims)
    }
}

/// In-process per-key write locks for the read-modify-write operations,
/// so mutations of unrelated keys never serialize on each other.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str, timeout: Duration) -> CacheResult<KeyGuard> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        lock.try_lock_arc_for(timeout).ok_or(CacheError::Timeout {
            op: "per-key lock",
            waited: timeout,
        })
    }

    /// Non-blocking variant used by the sweeper, which yields on
    /// contention instead of waiting.
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        lock.try_lock_arc()
    }

    /// Drop table entries no caller holds. Invoked by the sweeper to
    /// keep the table bounded by the live working set.
    pub fn gc(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.locks.len()
    }
}

fn remaining(started: Instant, timeout: Duration) -> CacheResult<Duration> {
    timeout
        .checked_sub(started.elapsed())
        .ok_or(CacheError::Timeout {
            op: "index lock",
            waited: timeout,
        })
}

fn sleep_with_jitter() {
    let millis = rand::thread_rng().gen_range(1..=10);
    std::thread::sleep(Duration::from_millis(millis));
}

/// Stable token distinguishing this boot of this machine inside claim
/// names, so a recycled pid on another host (or after reboot) can never
/// be mistaken for the original claim owner.
fn boot_token() -> &'static str {
    static TOKEN: OnceLock<String> = OnceLock::new();
    TOKEN.get_or_init(|| {
        let from_kernel = fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .ok()
            .map(|s| s.trim().replace('-', ""))
            .filter(|s| s.len() >= 8);
        let token = match from_kernel {
            Some(id) => id[..8].to_string(),
            None => uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        token
    })
}

/// Lock claims live next to the data; exposing the prefix lets the
/// sweeper leave them alone when reclaiming stray files.
pub fn is_lock_artifact(name: &str) -> bool {
    name == LOCK_FILE_NAME || name.starts_with("index.lock.") || name.starts_with("claim.tmp.")
}
