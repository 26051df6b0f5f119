use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use driftcache_core::{CacheError, CacheResult, EntryMeta};

use crate::layout::ShardLayout;
use crate::probe::FsProfile;

const SIDECAR_MAGIC: [u8; 4] = *b"DFCM";
const SIDECAR_VERSION: u16 = 1;

/// Read/write granularity; the per-operation budget is checked between
/// chunks so a stalled network mount cannot wedge a caller forever.
const IO_CHUNK: usize = 1 << 20;

/// Attempts at replacing the final file on filesystems whose rename is
/// not atomic over an existing target.
const RENAME_RETRIES: u32 = 3;

/// Probes when resolving a fingerprint collision before giving up.
const MAX_COLLISION_PROBES: u32 = 64;

/// The `.meta` sidecar: everything needed to resurrect an index record
/// without the journal, plus the checksum that catches torn blob writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub key: String,
    pub blob_crc: u32,
    pub meta: EntryMeta,
}

impl Sidecar {
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let meta_bytes = bincode::serialize(&self.meta)
            .map_err(|e| CacheError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let key_bytes = self.key.as_bytes();

        let mut buf = Vec::with_capacity(16 + key_bytes.len() + meta_bytes.len());
        buf.extend_from_slice(&SIDECAR_MAGIC);
        buf.extend_from_slice(&SIDECAR_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.blob_crc.to_le_bytes());
        buf.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(key_bytes);
        buf.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&meta_bytes);
        buf.extend_from_slice(&crc32fast::hash(&buf).to_le_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Sidecar, String> {
        if buf.len() < 16 {
            return Err(format!("sidecar is {} bytes, shorter than the header", buf.len()));
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte slice"));
        if crc32fast::hash(body) != stored_crc {
            return Err("sidecar checksum mismatch".into());
        }
        if body[0..4] != SIDECAR_MAGIC {
            return Err("bad sidecar magic".into());
        }
        let version = u16::from_le_bytes(body[4..6].try_into().expect("2-byte slice"));
        if version != SIDECAR_VERSION {
            return Err(format!("unsupported sidecar version {version}"));
        }
        let blob_crc = u32::from_le_bytes(body[6..10].try_into().expect("4-byte slice"));
        let key_len = u16::from_le_bytes(body[10..12].try_into().expect("2-byte slice")) as usize;
        if body.len() < 12 + key_len + 4 {
            return Err("sidecar key field truncated".into());
        }
        let key = std::str::from_utf8(&body[12..12 + key_len])
            .map_err(|_| "sidecar key is not UTF-8".to_string())?
            .to_string();
        let meta_off = 12 + key_len;
        let meta_len =
            u32::from_le_bytes(body[meta_off..meta_off + 4].try_into().expect("4-byte slice"))
                as usize;
        if body.len() != meta_off + 4 + meta_len {
            return Err("sidecar metadata field truncated".into());
        }
        let meta: EntryMeta = bincode::deserialize(&body[meta_off + 4..])
            .map_err(|e| format!("sidecar metadata undecodable: {e}"))?;
        Ok(Sidecar { key, blob_crc, meta })
    }
}

/// A fully written, checksummed value waiting in a temp file for its
/// rename into place. Dropping it without committing removes the file.
pub struct StagedBlob {
    temp: tempfile::NamedTempFile,
    pub len: u64,
    pub crc: u32,
}

/// Write, read and delete value files together with their sidecars.
///
/// All writes land in a uniquely named temp file in the destination
/// leaf directory and reach the final name through a rename, so a
/// reader never observes a half-written value under a live name.
#[derive(Debug)]
pub struct BlobStore {
    layout: ShardLayout,
    profile: FsProfile,
    io_budget: Duration,
}

impl BlobStore {
    pub fn new(layout: ShardLayout, profile: FsProfile, io_budget: Duration) -> Self {
        Self {
            layout,
            profile,
            io_budget,
        }
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Write `value` into a temp file next to its final location.
    ///
    /// Runs outside any lock: only the final rename (in [`commit`]) has
    /// to sit inside a critical section.
    ///
    /// [`commit`]: BlobStore::commit
    pub fn stage(&self, fp: u64, stem: &str, value: &[u8]) -> CacheResult<StagedBlob> {
        let leaf = self.layout.leaf_dir(fp);
        fs::create_dir_all(&leaf)?;

        let started = Instant::now();
        let mut temp = tempfile::Builder::new()
            .prefix(&ShardLayout::temp_prefix(stem))
            .tempfile_in(&leaf)?;

        let mut hasher = crc32fast::Hasher::new();
        for chunk in value.chunks(IO_CHUNK) {
            self.check_budget(started, "blob write")?;
            temp.write_all(chunk)?;
            hasher.update(chunk);
        }
        if self.profile.fsync_is_cheap {
            temp.as_file().sync_all()?;
        } else {
            temp.flush()?;
        }

        Ok(StagedBlob {
            temp,
            len: value.len() as u64,
            crc: hasher.finalize(),
        })
    }

    /// Move a staged value to its final name and write the sidecar.
    ///
    /// Ordering: the `.bin` rename happens first, then the sidecar, so
    /// the short window a crash can leave behind is a bin without meta,
    /// which the sweeper reclaims.
    pub fn commit(&self, fp: u64, stem: &str, staged: StagedBlob, sidecar: &Sidecar) -> CacheResult<()> {
        let bin = self.layout.bin_path(fp, stem);
        self.persist_with_retry(staged.temp, &bin)?;
        self.write_sidecar(fp, stem, sidecar)?;
        self.sync_leaf_dir(fp);
        debug!(stem, len = staged.len, "committed blob");
        Ok(())
    }

    /// Replace only the sidecar, leaving the value untouched. Used when
    /// metadata changes without a rewrite (expiry updates).
    pub fn write_sidecar(&self, fp: u64, stem: &str, sidecar: &Sidecar) -> CacheResult<()> {
        let leaf = self.layout.leaf_dir(fp);
        fs::create_dir_all(&leaf)?;
        let mut temp = tempfile::Builder::new()
            .prefix(&ShardLayout::temp_prefix(stem))
            .tempfile_in(&leaf)?;
        temp.write_all(&sidecar.encode()?)?;
        if self.profile.fsync_is_cheap {
            temp.as_file().sync_all()?;
        }
        self.persist_with_retry(temp, &self.layout.meta_path(fp, stem))?;
        Ok(())
    }

    /// Read and verify a value. On success returns the bytes plus the
    /// stem they were actually found under, which differs from the one
    /// passed in only after a fingerprint collision was re-resolved.
    pub fn read(&self, fp: u64, stem: &str, key: &str) -> CacheResult<(Vec<u8>, String)> {
        let mut stem = stem.to_string();
        let sidecar = match self.read_sidecar(fp, &stem)? {
            Some(s) if s.key == key => s,
            _ => {
                // Stem stale or occupied by a colliding key; walk the
                // disambiguation chain before declaring the entry gone.
                match self.resolve_stem_for_read(fp, key)? {
                    Some((resolved, s)) => {
                        stem = resolved;
                        s
                    }
                    None => return Err(CacheError::NotFound),
                }
            }
        };

        let bin = self.layout.bin_path(fp, &stem);
        let bytes = self.read_file_budgeted(&bin, "blob read").map_err(|e| match e {
            CacheError::IOError(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                CacheError::NotFound
            }
            other => other,
        })?;

        if bytes.len() as u64 != sidecar.meta.size {
            return Err(CacheError::corrupted_entry(
                key,
                format!(
                    "blob is {} bytes, sidecar records {}",
                    bytes.len(),
                    sidecar.meta.size
                ),
            ));
        }
        if crc32fast::hash(&bytes) != sidecar.blob_crc {
            return Err(CacheError::corrupted_entry(key, "blob checksum mismatch"));
        }
        Ok((bytes, stem))
    }

    /// Decode the sidecar under a stem, if one exists and parses.
    /// An unreadable sidecar is reported as `Ok(None)` here; corruption
    /// surfaces from the value read path where the key is known.
    pub fn read_sidecar(&self, fp: u64, stem: &str) -> CacheResult<Option<Sidecar>> {
        let path = self.layout.meta_path(fp, stem);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Sidecar::decode(&buf) {
            Ok(sidecar) => Ok(Some(sidecar)),
            Err(reason) => {
                warn!(path = %path.display(), %reason, "ignoring undecodable sidecar");
                Ok(None)
            }
        }
    }

    /// Unlink an entry's files, value first so no window exists where a
    /// sidecar-less value looks live. Returns whether anything existed.
    pub fn delete(&self, fp: u64, stem: &str) -> CacheResult<bool> {
        let removed_bin = remove_if_present(&self.layout.bin_path(fp, stem))?;
        let removed_meta = remove_if_present(&self.layout.meta_path(fp, stem))?;
        Ok(removed_bin || removed_meta)
    }

    pub fn bin_exists(&self, fp: u64, stem: &str) -> bool {
        self.layout.bin_path(fp, stem).exists()
    }

    /// Pick the stem a new write for `key` should use: the first one in
    /// the collision chain that is free or already owned by `key`.
    pub fn resolve_stem_for_write(&self, fp: u64, key: &str) -> CacheResult<String> {
        for n in 0..MAX_COLLISION_PROBES {
            let stem = self.layout.collision_stem(fp, n);
            match self.read_sidecar(fp, &stem)? {
                None if self.layout.meta_path(fp, &stem).exists() => continue, // junk sidecar
                None => return Ok(stem),
                Some(sidecar) if sidecar.key == key => return Ok(stem),
                Some(_) => continue,
            }
        }
        Err(CacheError::corrupted_entry(
            key,
            "fingerprint collision chain exhausted",
        ))
    }

    /// Find the stem that actually holds `key`, or `None` when the
    /// chain ends without a match.
    pub fn resolve_stem_for_read(&self, fp: u64, key: &str) -> CacheResult<Option<(String, Sidecar)>> {
        for n in 0..MAX_COLLISION_PROBES {
            let stem = self.layout.collision_stem(fp, n);
            let meta_path = self.layout.meta_path(fp, &stem);
            if !meta_path.exists() {
                return Ok(None);
            }
            if let Some(sidecar) = self.read_sidecar(fp, &stem)? {
                if sidecar.key == key {
                    return Ok(Some((stem, sidecar)));
                }
            }
        }
        Ok(None)
    }

    fn read_file_budgeted(&self, path: &Path, op: &'static str) -> CacheResult<Vec<u8>> {
        let started = Instant::now();
        let mut file = File::open(path)?;
        let expected = file.metadata()?.len() as usize;
        let mut buf = Vec::with_capacity(expected.min(64 * IO_CHUNK));
        let mut chunk = vec![0u8; IO_CHUNK.min(expected.max(1))];
        loop {
            self.check_budget(started, op)?;
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    }

    fn persist_with_retry(&self, temp: tempfile::NamedTempFile, target: &Path) -> CacheResult<()> {
        if self.profile.supports_atomic_rename {
            temp.persist(target).map_err(|e| CacheError::IOError(e.error))?;
            return Ok(());
        }
        // Degraded filesystems: replace may transiently fail while a
        // reader holds the old file. The sidecar checksum catches any
        // torn outcome on the next read.
        let mut temp = temp;
        let mut last: Option<std::io::Error> = None;
        for attempt in 0..RENAME_RETRIES {
            match temp.persist(target) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if attempt + 1 < RENAME_RETRIES {
                        let _ = fs::remove_file(target);
                        std::thread::sleep(Duration::from_millis(10 << attempt));
                    }
                    temp = e.file;
                    last = Some(e.error);
                }
            }
        }
        Err(CacheError::IOError(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "rename retries exhausted")
        })))
    }

    /// Directory entry durability: only worth paying for where fsync is
    /// cheap, per the probe. Failures are ignored; the worst case is a
    /// directory entry that resurfaces as a sweepable orphan.
    fn sync_leaf_dir(&self, fp: u64) {
        if !self.profile.fsync_is_cheap || self.profile.is_network {
            return;
        }
        if let Ok(dir) = File::open(self.layout.leaf_dir(fp)) {
            let _ = dir.sync_all();
        }
    }

    fn check_budget(&self, started: Instant, op: &'static str) -> CacheResult<()> {
        let waited = started.elapsed();
        if waited > self.io_budget {
            return Err(CacheError::Timeout { op, waited });
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
