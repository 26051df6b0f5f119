use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Round-trip latency above which a directory is treated as
/// network-backed.
const NETWORK_LATENCY_FLOOR: Duration = Duration::from_millis(5);

/// `fsync` cost below which per-write syncs are considered affordable.
const CHEAP_FSYNC_CEILING: Duration = Duration::from_millis(2);

/// What the probe learned about the backing directory.
///
/// Writers consult this once, at construction, to pick open flags,
/// rename-versus-retry semantics, and whether to pay for fsyncs.
#[derive(Debug, Clone, Copy)]
pub struct FsProfile {
    /// Directory appears to live on a network filesystem.
    pub is_network: bool,
    /// A same-directory rename replaced the target in one step.
    pub supports_atomic_rename: bool,
    /// `fsync` completes fast enough to run on every blob write.
    pub fsync_is_cheap: bool,
}

impl FsProfile {
    /// Classify `dir` with a handful of cheap observations: a path-shape
    /// heuristic, one write-then-stat round trip, one timed fsync, and
    /// one same-directory rename. Uncertainty resolves toward "local":
    /// misclassifying a network mount as local costs durability edge
    /// cases the journal already tolerates, while the reverse taxes
    /// every operation.
    pub fn probe(dir: &Path) -> std::io::Result<FsProfile> {
        fs::create_dir_all(dir)?;

        let scratch = dir.join(format!("probe.{}.tmp", uuid::Uuid::new_v4().simple()));
        let renamed = dir.join(format!("probe.{}.tmp", uuid::Uuid::new_v4().simple()));

        let started = Instant::now();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&scratch)?;
        file.write_all(b"driftcache probe")?;
        fs::metadata(&scratch)?;
        let round_trip = started.elapsed();

        let sync_started = Instant::now();
        let sync_ok = file.sync_all().is_ok();
        let sync_cost = sync_started.elapsed();
        drop(file);

        let rename_ok = fs::rename(&scratch, &renamed).is_ok();
        let _ = fs::remove_file(if rename_ok { &renamed } else { &scratch });

        let profile = FsProfile {
            is_network: looks_remote(dir) || round_trip > NETWORK_LATENCY_FLOOR,
            supports_atomic_rename: rename_ok,
            fsync_is_cheap: sync_ok && sync_cost <= CHEAP_FSYNC_CEILING,
        };

        debug!(
            ?round_trip,
            ?sync_cost,
            rename_ok,
            "filesystem probe round trip complete"
        );
        info!(
            is_network = profile.is_network,
            supports_atomic_rename = profile.supports_atomic_rename,
            fsync_is_cheap = profile.fsync_is_cheap,
            "classified cache directory"
        );
        Ok(profile)
    }

    /// Profile for a known-local directory; used by tests to skip the
    /// timing round trip.
    pub fn assume_local() -> FsProfile {
        FsProfile {
            is_network: false,
            supports_atomic_rename: true,
            fsync_is_cheap: true,
        }
    }

    /// Profile of a worst-case network share.
    pub fn assume_network() -> FsProfile {
        FsProfile {
            is_network: true,
            supports_atomic_rename: false,
            fsync_is_cheap: false,
        }
    }
}

/// Path-shape heuristic for remote mounts: UNC prefixes and the
/// well-known mount roots. Platform-specific mount-table queries would
/// be sharper but this errs toward "local", which the latency check
/// then corrects.
fn looks_remote(dir: &Path) -> bool {
    let text = dir.to_string_lossy();
    if text.starts_with("\\\\") || text.starts_with("//") {
        return true;
    }
    const REMOTE_PREFIXES: [&str; 5] = ["/mnt/", "/media/", "/Volumes/", "/net/", "/smb/"];
    REMOTE_PREFIXES.iter().any(|p| text.starts_with(p))
}
