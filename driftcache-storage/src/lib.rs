//! # driftcache storage subsystem
//!
//! Everything that touches the backing directory lives here: the
//! filesystem probe, the sharded on-disk layout, the blob store, the
//! journaled index, the lock manager, the background sweeper, and the
//! one-shot legacy-store migrator.
//!
//! ## On-disk layout
//!
//! ```text
//! index.snapshot              optional compacted index image
//! index.log, index.log.1..N   append-only journals
//! index.lock*                 advisory lock file / rename-lease claims
//! ab/cd/<hexfp>.bin           value bytes
//! ab/cd/<hexfp>.meta          sidecar: key, metadata, blob checksum
//! ab/cd/<hexfp>.bin.tmp.*     transient staging files
//! legacy_backup/              archive of an imported legacy store
//! ```
//!
//! ## Crash-safety protocol
//!
//! Values reach their final name only through a rename of a fully
//! written, checksummed temp file in the same leaf directory. Liveness
//! is decided by the journal alone; a blob pair the journal never
//! acknowledged is an orphan and gets reclaimed by the sweeper. The
//! journal itself tolerates a torn trailing record (discarded on
//! replay) and falls back to a full directory rescan when a record
//! fails verification, because every sidecar carries enough state to
//! rebuild its index record from scratch.

mod blob;      // Atomic value files plus their metadata sidecars
mod index;     // In-memory map backed by the append-only journal
mod journal;   // Record framing, rotation, snapshot encode/decode
mod layout;    // Key fingerprints and the two-level shard directories
mod lock;      // Inter-process lease and the per-key mutex table
mod migrate;   // Import of a foreign single-file legacy store
mod probe;     // Filesystem classification driving I/O strategy
mod sweeper;   // Background expiration and orphan reclamation

pub use blob::{BlobStore, Sidecar, StagedBlob};
pub use index::{Index, IndexRecord, WriteTxn};
pub use journal::{JournalOp, JournalRecord, LOG_ROTATE_BYTES, MAX_ROTATED_LOGS};
pub use layout::{fingerprint, fingerprint_hex, ShardLayout};
pub use lock::{InterProcessLock, IpGuard, KeyGuard, KeyLocks};
pub use migrate::{
    import_legacy_store, legacy_store_present, LegacyRow, LEGACY_BACKUP_DIR, LEGACY_STORE_FILE,
    MIGRATED_STORE_FILE,
};
pub use probe::FsProfile;
pub use sweeper::{sweep_once, SweepStats, Sweeper};
