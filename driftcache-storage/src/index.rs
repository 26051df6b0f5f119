use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use driftcache_core::{CacheError, CacheResult, EntryMeta};

use crate::blob::Sidecar;
use crate::journal::{
    self, encode_record, live_log_path, parse_record, rotated_log_numbers, rotated_log_path,
    write_snapshot, JournalOp, JournalRecord, RecordParse, SnapshotEntry, LOG_ROTATE_BYTES,
    MAX_ROTATED_LOGS, SNAPSHOT_NAME,
};
use crate::layout::ShardLayout;
use crate::lock::{InterProcessLock, IpGuard};
use crate::probe::FsProfile;

/// One live entry as the index sees it: where the blob lives plus its
/// metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub fingerprint: u64,
    pub stem: String,
    /// Journal sequence of the PUT that wrote the current value. Only
    /// value-changing writes bump it (TOUCH does not), so equality
    /// proves a cached copy of the bytes is still current.
    pub value_seq: u64,
    pub meta: EntryMeta,
}

#[derive(Debug, Default)]
struct IndexState {
    map: HashMap<String, IndexRecord>,
    total_bytes: u64,
    applied_seq: u64,
}

impl IndexState {
    fn apply(&mut self, record: &JournalRecord, layout: &ShardLayout) {
        if record.seq <= self.applied_seq && self.applied_seq != 0 {
            return; // already folded into the snapshot or an earlier replay
        }
        match record.op {
            JournalOp::Put => {
                let Some(meta) = record.meta.clone() else {
                    warn!(seq = record.seq, "ignoring PUT record without metadata");
                    return;
                };
                let fingerprint = crate::layout::fingerprint(&record.key);
                let stem = match self.map.get(&record.key) {
                    Some(existing) => {
                        self.total_bytes = self.total_bytes.saturating_sub(existing.meta.size);
                        existing.stem.clone()
                    }
                    None => layout.default_stem(fingerprint),
                };
                self.total_bytes += meta.size;
                self.map.insert(
                    record.key.clone(),
                    IndexRecord {
                        fingerprint,
                        stem,
                        value_seq: record.seq,
                        meta,
                    },
                );
            }
            JournalOp::Del => {
                if let Some(removed) = self.map.remove(&record.key) {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.meta.size);
                }
            }
            JournalOp::Touch => {
                if let (Some(existing), Some(meta)) =
                    (self.map.get_mut(&record.key), record.meta.clone())
                {
                    self.total_bytes = self.total_bytes.saturating_sub(existing.meta.size);
                    self.total_bytes += meta.size;
                    existing.meta = meta;
                }
            }
            JournalOp::Clear => {
                self.map.clear();
                self.total_bytes = 0;
            }
        }
        self.applied_seq = self.applied_seq.max(record.seq);
    }
}

/// Replay cursor over the live journal file. Guarded by its own mutex,
/// which doubles as the in-process writer serialization point.
#[derive(Debug, Default)]
struct JournalCursor {
    /// Bytes of `index.log` already applied to the in-memory map.
    live_len: u64,
}

/// The persistent key-to-metadata mapping: a hash map in memory, an
/// append-only journal on disk.
///
/// The journal plus the `.meta` sidecars make the index rebuildable
/// from the blob tree alone, which is what lets this engine avoid a
/// monolithic database file entirely.
#[derive(Debug)]
pub struct Index {
    root: PathBuf,
    layout: ShardLayout,
    profile: FsProfile,
    inner: RwLock<IndexState>,
    cursor: Mutex<JournalCursor>,
    ip_lock: InterProcessLock,
    lock_timeout: Duration,
}

impl Index {
    /// Open (or create) the index under `root`.
    ///
    /// Procedure: read the snapshot if present, replay rotated logs then
    /// the live log in order, and cross-check the result against the
    /// blob tree. Verification failure anywhere falls back to a full
    /// directory rescan that rebuilds the index from the sidecars.
    pub fn open(root: &Path, profile: FsProfile, lock_timeout: Duration) -> CacheResult<Index> {
        fs::create_dir_all(root)?;
        let layout = ShardLayout::new(root);
        let ip_lock = InterProcessLock::new(root, profile);

        let guard = ip_lock.acquire(lock_timeout)?;
        let (state, cursor) = match load_state(root, &layout) {
            Ok(loaded) => loaded,
            Err(CacheError::CorruptedIndex { reason }) => {
                warn!(%reason, "index verification failed, rescanning directory");
                rescan(root, &layout)?
            }
            Err(other) => return Err(other),
        };
        drop(guard);

        info!(
            entries = state.map.len(),
            bytes = state.total_bytes,
            seq = state.applied_seq,
            "opened index"
        );

        let index = Index {
            root: root.to_path_buf(),
            layout,
            profile,
            inner: RwLock::new(state),
            cursor: Mutex::new(cursor),
            ip_lock,
            lock_timeout,
        };
        index.cross_check()?;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lookup(&self, key: &str) -> Option<IndexRecord> {
        self.inner.read().map.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().map.contains_key(key)
    }

    /// Point-in-time copy of the live mapping. Entries written after
    /// the call may be missing; entries deleted after it may linger.
    pub fn scan(&self) -> Vec<(String, IndexRecord)> {
        self.inner
            .read()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> u64 {
        self.inner.read().map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    pub fn volume(&self) -> u64 {
        self.inner.read().total_bytes
    }

    /// Fold in journal records appended by other processes since the
    /// last look. Cheap when nothing changed: one `stat` of the live
    /// log.
    pub fn refresh(&self) -> CacheResult<()> {
        let live_len = file_len(&live_log_path(&self.root));
        {
            let cursor = self.cursor.lock();
            if live_len == cursor.live_len {
                return Ok(());
            }
        }
        let mut cursor = self.cursor.lock();
        let _ip = self.ip_lock.acquire(self.lock_timeout)?;
        self.catch_up_locked(&mut cursor)
    }

    /// Start a mutating transaction: in-process writer lock plus the
    /// inter-process lock, held only for the journal append (and the
    /// committing rename the caller performs inside it).
    pub fn write_txn(&self) -> CacheResult<WriteTxn<'_>> {
        let mut cursor = self.cursor.lock();
        let ip = self.ip_lock.acquire(self.lock_timeout)?;
        self.catch_up_locked(&mut cursor)?;
        Ok(WriteTxn {
            index: self,
            cursor,
            _ip: ip,
        })
    }

    /// Record a memory-tier hit's recency in the map without paying for
    /// a journal append. Replay regenerates older recency, which only
    /// ever makes eviction more conservative.
    pub fn note_access(&self, key: &str, now: u64) {
        if let Some(record) = self.inner.write().map.get_mut(key) {
            record.meta.note_access(now);
        }
    }

    /// Repoint a record at the stem a collision re-resolution found.
    /// Map-only: the sidecar already records the truth.
    pub fn fix_stem(&self, key: &str, stem: &str) {
        if let Some(record) = self.inner.write().map.get_mut(key) {
            record.stem = stem.to_string();
        }
    }

    /// Apply journal records other processes appended to the live log,
    /// or rebuild outright when the log was rotated or cleared under us.
    fn catch_up_locked(&self, cursor: &mut JournalCursor) -> CacheResult<()> {
        let live = live_log_path(&self.root);
        let live_len = file_len(&live);
        if live_len == cursor.live_len {
            return Ok(());
        }
        if live_len < cursor.live_len {
            // The log shrank: rotated or compacted by another process.
            debug!("live journal replaced, reloading index state");
            let (state, new_cursor) = match load_state(&self.root, &self.layout) {
                Ok(loaded) => loaded,
                Err(CacheError::CorruptedIndex { reason }) => {
                    warn!(%reason, "index verification failed, rescanning directory");
                    rescan(&self.root, &self.layout)?
                }
                Err(other) => return Err(other),
            };
            *self.inner.write() = state;
            *cursor = new_cursor;
            return Ok(());
        }

        let buf = fs::read(&live)?;
        let mut offset = cursor.live_len as usize;
        let mut inner = self.inner.write();
        while offset < buf.len() {
            match parse_record(&buf[offset..]) {
                RecordParse::Complete { record, consumed } => {
                    inner.apply(&record, &self.layout);
                    offset += consumed;
                }
                RecordParse::Truncated => break,
                RecordParse::Corrupt(reason) => {
                    return Err(CacheError::corrupted_index(reason));
                }
            }
        }
        cursor.live_len = offset as u64;
        Ok(())
    }

    /// Verify each mapped entry still has its blob; drop (and journal a
    /// DEL for) the ones that do not, and report sidecars the map does
    /// not know about so the sweeper can reclaim them.
    fn cross_check(&self) -> CacheResult<()> {
        let dangling: Vec<(String, IndexRecord)> = {
            let inner = self.inner.read();
            inner
                .map
                .iter()
                .filter(|(_, record)| {
                    !self
                        .layout
                        .bin_path(record.fingerprint, &record.stem)
                        .exists()
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        if !dangling.is_empty() {
            warn!(
                count = dangling.len(),
                "dropping index records whose blobs are gone"
            );
            let mut txn = self.write_txn()?;
            for (key, _) in &dangling {
                txn.delete(key)?;
            }
        }

        let mut orphan_sidecars = 0usize;
        let inner = self.inner.read();
        for leaf in self.layout.leaf_dirs()? {
            for entry in fs::read_dir(&leaf)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.ends_with(".meta") {
                    continue;
                }
                let known = fs::read(entry.path())
                    .ok()
                    .and_then(|buf| Sidecar::decode(&buf).ok())
                    .map(|sidecar| inner.map.contains_key(&sidecar.key))
                    .unwrap_or(false);
                if !known {
                    orphan_sidecars += 1;
                }
            }
        }
        if orphan_sidecars > 0 {
            warn!(count = orphan_sidecars, "orphan sidecars left for the sweeper");
        }
        Ok(())
    }
}

/// A held write transaction. Every mutation appends one journal record
/// and applies it to the in-memory map before returning.
pub struct WriteTxn<'a> {
    index: &'a Index,
    cursor: MutexGuard<'a, JournalCursor>,
    _ip: IpGuard,
}

impl WriteTxn<'_> {
    /// Look up under the txn, after catch-up: the freshest view this
    /// process can have.
    pub fn lookup(&self, key: &str) -> Option<IndexRecord> {
        self.index.lookup(key)
    }

    /// Append a PUT and apply it, returning the sequence it was
    /// journaled under (the entry's new `value_seq`).
    pub fn put(&mut self, key: &str, stem: &str, meta: EntryMeta) -> CacheResult<u64> {
        let seq = self.next_seq();
        self.append_apply(&JournalRecord::put(seq, key, meta))?;
        // Replay derives the default stem; a collision-shifted stem is
        // corrected here where it is known exactly.
        self.index.fix_stem(key, stem);
        Ok(seq)
    }

    pub fn delete(&mut self, key: &str) -> CacheResult<Option<IndexRecord>> {
        let removed = self.index.lookup(key);
        if removed.is_some() {
            let seq = self.next_seq();
            self.append_apply(&JournalRecord::del(seq, key))?;
        }
        Ok(removed)
    }

    pub fn touch(&mut self, key: &str, meta: EntryMeta) -> CacheResult<bool> {
        if self.index.lookup(key).is_none() {
            return Ok(false);
        }
        let seq = self.next_seq();
        self.append_apply(&JournalRecord::touch(seq, key, meta))?;
        Ok(true)
    }

    /// Empty the index, returning the records that were live so the
    /// caller can unlink their files.
    pub fn clear(&mut self) -> CacheResult<Vec<(String, IndexRecord)>> {
        let drained = self.index.scan();
        let seq = self.next_seq();
        self.append_apply(&JournalRecord::clear(seq))?;
        Ok(drained)
    }

    fn next_seq(&self) -> u64 {
        self.index.inner.read().applied_seq + 1
    }

    fn append_apply(&mut self, record: &JournalRecord) -> CacheResult<()> {
        let live = live_log_path(&self.index.root);
        let bytes = encode_record(record)?;

        // Discard a torn tail left by a crashed writer before appending
        // after it; the replay cursor marks the last verified boundary.
        let on_disk = file_len(&live);
        if on_disk > self.cursor.live_len {
            warn!(
                torn_bytes = on_disk - self.cursor.live_len,
                "truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(&live)?;
            file.set_len(self.cursor.live_len)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&live)?;
        file.write_all(&bytes)?;
        if self.index.profile.fsync_is_cheap {
            file.sync_all()?;
        }
        drop(file);

        self.cursor.live_len += bytes.len() as u64;
        self.index.inner.write().apply(record, &self.index.layout);

        if self.cursor.live_len > LOG_ROTATE_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> CacheResult<()> {
        let root = &self.index.root;
        let rotated = rotated_log_numbers(root)?;
        let next = rotated.last().map(|n| n + 1).unwrap_or(1);
        fs::rename(live_log_path(root), rotated_log_path(root, next))?;
        self.cursor.live_len = 0;
        debug!(generation = next, "rotated journal");

        if rotated.len() + 1 > MAX_ROTATED_LOGS {
            self.compact()?;
        }
        Ok(())
    }

    /// Fold everything into a fresh snapshot and drop the rotated logs.
    fn compact(&mut self) -> CacheResult<()> {
        let root = &self.index.root;
        let (seq, entries) = {
            let inner = self.index.inner.read();
            let entries: Vec<SnapshotEntry> = inner
                .map
                .iter()
                .map(|(key, record)| SnapshotEntry {
                    key: key.clone(),
                    fingerprint: record.fingerprint,
                    stem: record.stem.clone(),
                    value_seq: record.value_seq,
                    meta: record.meta.clone(),
                })
                .collect();
            (inner.applied_seq, entries)
        };
        write_snapshot(root, seq, &entries)?;
        for n in rotated_log_numbers(root)? {
            let _ = fs::remove_file(rotated_log_path(root, n));
        }
        info!(entries = entries.len(), seq, "compacted index into snapshot");
        Ok(())
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Snapshot-then-replay load path.
fn load_state(root: &Path, layout: &ShardLayout) -> CacheResult<(IndexState, JournalCursor)> {
    let mut state = IndexState::default();

    let snapshot_path = root.join(SNAPSHOT_NAME);
    if snapshot_path.exists() {
        let bytes = fs::read(&snapshot_path)?;
        let (seq, entries) = journal::decode_snapshot(&bytes)?;
        for entry in entries {
            state.total_bytes += entry.meta.size;
            state.map.insert(
                entry.key,
                IndexRecord {
                    fingerprint: entry.fingerprint,
                    stem: entry.stem,
                    value_seq: entry.value_seq,
                    meta: entry.meta,
                },
            );
        }
        state.applied_seq = seq;
    }

    for n in rotated_log_numbers(root)? {
        replay_log(&rotated_log_path(root, n), &mut state, layout)?;
    }
    let live_applied = replay_log(&live_log_path(root), &mut state, layout)?;

    Ok((
        state,
        JournalCursor {
            live_len: live_applied,
        },
    ))
}

/// Replay one journal file, returning how many bytes held complete
/// records. A torn trailing record is discarded with a warning;
/// structural corruption aborts the load.
fn replay_log(path: &Path, state: &mut IndexState, layout: &ShardLayout) -> CacheResult<u64> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut offset = 0usize;
    while offset < buf.len() {
        match parse_record(&buf[offset..]) {
            RecordParse::Complete { record, consumed } => {
                state.apply(&record, layout);
                offset += consumed;
            }
            RecordParse::Truncated => {
                warn!(
                    path = %path.display(),
                    discarded = buf.len() - offset,
                    "discarding torn journal tail"
                );
                break;
            }
            RecordParse::Corrupt(reason) => {
                return Err(CacheError::corrupted_index(format!(
                    "{}: {reason}",
                    path.display()
                )));
            }
        }
    }
    Ok(offset as u64)
}

/// Rebuild the index from the blob tree alone: every decodable sidecar
/// whose blob exists becomes a record. Ends with a fresh snapshot and
/// empty logs.
fn rescan(root: &Path, layout: &ShardLayout) -> CacheResult<(IndexState, JournalCursor)> {
    let mut state = IndexState::default();

    for leaf in layout.leaf_dirs()? {
        for entry in fs::read_dir(&leaf)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".meta") else {
                continue;
            };
            let Ok(buf) = fs::read(entry.path()) else {
                continue;
            };
            let Ok(sidecar) = Sidecar::decode(&buf) else {
                warn!(path = %entry.path().display(), "skipping undecodable sidecar in rescan");
                continue;
            };
            let fingerprint = crate::layout::fingerprint(&sidecar.key);
            if !layout.bin_path(fingerprint, stem).exists() {
                continue; // orphan sidecar, sweeper's problem
            }
            // Two sidecars can claim one key after an interrupted
            // overwrite; the newer write wins.
            let keep = match state.map.get(&sidecar.key) {
                Some(existing) => sidecar.meta.created_at >= existing.meta.created_at,
                None => true,
            };
            if keep {
                if let Some(prior) = state.map.remove(&sidecar.key) {
                    state.total_bytes = state.total_bytes.saturating_sub(prior.meta.size);
                }
                state.total_bytes += sidecar.meta.size;
                // Sequence numbering restarts after a rescan; zero can
                // never match a cached copy, so stale tiers re-read.
                state.map.insert(
                    sidecar.key.clone(),
                    IndexRecord {
                        fingerprint,
                        stem: stem.to_string(),
                        value_seq: 0,
                        meta: sidecar.meta,
                    },
                );
            }
        }
    }

    let entries: Vec<SnapshotEntry> = state
        .map
        .iter()
        .map(|(key, record)| SnapshotEntry {
            key: key.clone(),
            fingerprint: record.fingerprint,
            stem: record.stem.clone(),
            value_seq: record.value_seq,
            meta: record.meta.clone(),
        })
        .collect();
    write_snapshot(root, state.applied_seq, &entries)?;
    let _ = fs::remove_file(live_log_path(root));
    for n in rotated_log_numbers(root)? {
        let _ = fs::remove_file(rotated_log_path(root, n));
    }

    info!(entries = entries.len(), "rebuilt index from directory rescan");
    Ok((state, JournalCursor::default()))
}
