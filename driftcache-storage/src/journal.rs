use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use driftcache_core::{CacheError, CacheResult, EntryMeta};

/// Record framing magic, `"DFCJ"`.
pub const JOURNAL_MAGIC: [u8; 4] = *b"DFCJ";
pub const JOURNAL_VERSION: u16 = 1;

/// Snapshot framing magic, `"DFCS"`.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"DFCS";
pub const SNAPSHOT_VERSION: u16 = 1;

/// Live log size beyond which it is rotated to `index.log.N`.
pub const LOG_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Rotated logs tolerated before everything is compacted into a
/// snapshot.
pub const MAX_ROTATED_LOGS: usize = 4;

pub const LIVE_LOG_NAME: &str = "index.log";
pub const SNAPSHOT_NAME: &str = "index.snapshot";

/// Fixed bytes before the key field: magic, version, op, seq, key_len.
const RECORD_HEADER_LEN: usize = 4 + 2 + 1 + 8 + 2;

/// Journal operation discriminants as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOp {
    Put = 1,
    Del = 2,
    Touch = 3,
    Clear = 4,
}

impl JournalOp {
    fn from_raw(raw: u8) -> Option<JournalOp> {
        match raw {
            1 => Some(JournalOp::Put),
            2 => Some(JournalOp::Del),
            3 => Some(JournalOp::Touch),
            4 => Some(JournalOp::Clear),
            _ => None,
        }
    }
}

/// One journal record. `meta` is present for PUT and TOUCH, absent for
/// DEL and CLEAR; CLEAR also carries an empty key.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub op: JournalOp,
    pub seq: u64,
    pub key: String,
    pub meta: Option<EntryMeta>,
}

impl JournalRecord {
    pub fn put(seq: u64, key: impl Into<String>, meta: EntryMeta) -> Self {
        Self {
            op: JournalOp::Put,
            seq,
            key: key.into(),
            meta: Some(meta),
        }
    }

    pub fn del(seq: u64, key: impl Into<String>) -> Self {
        Self {
            op: JournalOp::Del,
            seq,
            key: key.into(),
            meta: None,
        }
    }

    pub fn touch(seq: u64, key: impl Into<String>, meta: EntryMeta) -> Self {
        Self {
            op: JournalOp::Touch,
            seq,
            key: key.into(),
            meta: Some(meta),
        }
    }

    pub fn clear(seq: u64) -> Self {
        Self {
            op: JournalOp::Clear,
            seq,
            key: String::new(),
            meta: None,
        }
    }
}

/// Wire encoding:
/// `magic(4) | version(2) | op(1) | seq(8) | key_len(2) | key |
///  meta_len(4) | meta | crc32(4)`, all integers little-endian, the
/// checksum covering every preceding byte of the record.
pub fn encode_record(record: &JournalRecord) -> CacheResult<Vec<u8>> {
    let meta_bytes = match &record.meta {
        Some(meta) => bincode::serialize(meta).map_err(invalid_data)?,
        None => Vec::new(),
    };
    let key_bytes = record.key.as_bytes();

    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + key_bytes.len() + 8 + meta_bytes.len());
    buf.extend_from_slice(&JOURNAL_MAGIC);
    buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    buf.push(record.op as u8);
    buf.extend_from_slice(&record.seq.to_le_bytes());
    buf.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(key_bytes);
    buf.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&meta_bytes);
    buf.extend_from_slice(&crc32fast::hash(&buf).to_le_bytes());
    Ok(buf)
}

/// Outcome of parsing one record at the head of `buf`.
#[derive(Debug)]
pub enum RecordParse {
    /// A complete, verified record occupying `consumed` bytes.
    Complete {
        record: JournalRecord,
        consumed: usize,
    },
    /// Buffer ends mid-record: a torn trailing write. Replay stops and
    /// discards the tail.
    Truncated,
    /// The bytes are structurally wrong or fail their checksum; the
    /// whole journal is suspect.
    Corrupt(String),
}

pub fn parse_record(buf: &[u8]) -> RecordParse {
    if buf.len() < RECORD_HEADER_LEN {
        return RecordParse::Truncated;
    }
    if buf[0..4] != JOURNAL_MAGIC {
        return RecordParse::Corrupt("bad record magic".into());
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().expect("2-byte slice"));
    if version != JOURNAL_VERSION {
        return RecordParse::Corrupt(format!("unsupported journal version {version}"));
    }
    let op = match JournalOp::from_raw(buf[6]) {
        Some(op) => op,
        None => return RecordParse::Corrupt(format!("unknown op {}", buf[6])),
    };
    let seq = u64::from_le_bytes(buf[7..15].try_into().expect("8-byte slice"));
    let key_len = u16::from_le_bytes(buf[15..17].try_into().expect("2-byte slice")) as usize;

    let meta_len_off = RECORD_HEADER_LEN + key_len;
    if buf.len() < meta_len_off + 4 {
        return RecordParse::Truncated;
    }
    let meta_len = u32::from_le_bytes(
        buf[meta_len_off..meta_len_off + 4]
            .try_into()
            .expect("4-byte slice"),
    ) as usize;
    let total = meta_len_off + 4 + meta_len + 4;
    if buf.len() < total {
        return RecordParse::Truncated;
    }

    let body = &buf[..total - 4];
    let stored_crc = u32::from_le_bytes(buf[total - 4..total].try_into().expect("4-byte slice"));
    if crc32fast::hash(body) != stored_crc {
        return RecordParse::Corrupt("record checksum mismatch".into());
    }

    let key = match std::str::from_utf8(&buf[RECORD_HEADER_LEN..meta_len_off]) {
        Ok(key) => key.to_string(),
        Err(_) => return RecordParse::Corrupt("record key is not UTF-8".into()),
    };
    let meta = if meta_len > 0 {
        match bincode::deserialize(&buf[meta_len_off + 4..total - 4]) {
            Ok(meta) => Some(meta),
            Err(e) => return RecordParse::Corrupt(format!("record metadata undecodable: {e}")),
        }
    } else {
        None
    };

    RecordParse::Complete {
        record: JournalRecord { op, seq, key, meta },
        consumed: total,
    }
}

/// One entry in the compacted snapshot image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub fingerprint: u64,
    pub stem: String,
    /// Sequence of the PUT that wrote the entry's current value.
    pub value_seq: u64,
    pub meta: EntryMeta,
}

/// Snapshot encoding: `magic(4) | version(2) | seq(8) | body_len(8) |
/// body | crc32(4)` where `body` is the serialized entry list and the
/// checksum covers everything before it.
pub fn encode_snapshot(seq: u64, entries: &[SnapshotEntry]) -> CacheResult<Vec<u8>> {
    let body = bincode::serialize(entries).map_err(invalid_data)?;
    let mut buf = Vec::with_capacity(26 + body.len());
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&buf).to_le_bytes());
    Ok(buf)
}

pub fn decode_snapshot(buf: &[u8]) -> CacheResult<(u64, Vec<SnapshotEntry>)> {
    if buf.len() < 26 {
        return Err(CacheError::corrupted_index("snapshot shorter than header"));
    }
    let (body_and_header, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte slice"));
    if crc32fast::hash(body_and_header) != stored_crc {
        return Err(CacheError::corrupted_index("snapshot checksum mismatch"));
    }
    if buf[0..4] != SNAPSHOT_MAGIC {
        return Err(CacheError::corrupted_index("bad snapshot magic"));
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().expect("2-byte slice"));
    if version != SNAPSHOT_VERSION {
        return Err(CacheError::corrupted_index(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let seq = u64::from_le_bytes(buf[6..14].try_into().expect("8-byte slice"));
    let body_len = u64::from_le_bytes(buf[14..22].try_into().expect("8-byte slice")) as usize;
    if buf.len() != 22 + body_len + 4 {
        return Err(CacheError::corrupted_index("snapshot length mismatch"));
    }
    let entries: Vec<SnapshotEntry> = bincode::deserialize(&buf[22..22 + body_len])
        .map_err(|e| CacheError::corrupted_index(format!("snapshot body undecodable: {e}")))?;
    Ok((seq, entries))
}

/// Write a snapshot through a temp file so a crash never leaves a
/// half-written image under the live name.
pub fn write_snapshot(root: &Path, seq: u64, entries: &[SnapshotEntry]) -> CacheResult<()> {
    let bytes = encode_snapshot(seq, entries)?;
    let mut temp = tempfile::Builder::new()
        .prefix("index.snapshot.tmp.")
        .tempfile_in(root)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(root.join(SNAPSHOT_NAME))
        .map_err(|e| CacheError::IOError(e.error))?;
    Ok(())
}

pub fn live_log_path(root: &Path) -> PathBuf {
    root.join(LIVE_LOG_NAME)
}

pub fn rotated_log_path(root: &Path, n: u32) -> PathBuf {
    root.join(format!("{LIVE_LOG_NAME}.{n}"))
}

/// Rotated log generation numbers present under `root`, ascending.
pub fn rotated_log_numbers(root: &Path) -> CacheResult<Vec<u32>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(suffix) = name.strip_prefix("index.log.") {
            if let Ok(n) = suffix.parse::<u32>() {
                numbers.push(n);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

fn invalid_data(e: bincode::Error) -> CacheError {
    CacheError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
