use std::fs;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use driftcache_core::{CacheError, CacheResult, MAX_TAG_CHARS};

use crate::journal::{LIVE_LOG_NAME, SNAPSHOT_NAME};

/// Signature file of the foreign single-file store.
pub const LEGACY_STORE_FILE: &str = "cache.db";

/// Name the legacy store is parked under once imported; its presence is
/// what makes a second open skip migration.
pub const MIGRATED_STORE_FILE: &str = "cache.db.migrated";

pub const LEGACY_BACKUP_DIR: &str = "legacy_backup";

/// One key/value row enumerated from the legacy store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRow {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at: Option<u64>,
    pub tags: Vec<String>,
}

/// A legacy store is migrated exactly once: only when its file exists
/// and no journaled index has ever been written next to it.
pub fn legacy_store_present(root: &Path) -> bool {
    root.join(LEGACY_STORE_FILE).exists()
        && !root.join(SNAPSHOT_NAME).exists()
        && !root.join(LIVE_LOG_NAME).exists()
}

/// Enumerate the legacy store's rows, feed each through `sink` (the
/// normal write path), then park the file as `cache.db.migrated` and
/// archive a copy under `legacy_backup/`.
///
/// Any failure before the rename leaves the legacy file untouched.
pub fn import_legacy_store(
    root: &Path,
    mut sink: impl FnMut(LegacyRow) -> CacheResult<()>,
) -> CacheResult<usize> {
    let db_path = root.join(LEGACY_STORE_FILE);
    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| CacheError::migration_failed(format!("cannot open legacy store: {e}")))?;

    let mut stmt = conn
        .prepare("SELECT key, value, filename, expire_time, tag FROM Cache")
        .map_err(|e| CacheError::migration_failed(format!("unrecognized legacy schema: {e}")))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| CacheError::migration_failed(format!("legacy query failed: {e}")))?;

    let mut imported = 0usize;
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => {
                return Err(CacheError::migration_failed(format!(
                    "legacy row enumeration failed: {e}"
                )))
            }
        };
        let Some(legacy) = decode_row(root, row)? else {
            continue;
        };
        sink(legacy).map_err(|e| {
            CacheError::migration_failed(format!("replaying legacy row failed: {e}"))
        })?;
        imported += 1;
    }
    drop(rows);
    drop(stmt);
    drop(conn);

    let migrated = root.join(MIGRATED_STORE_FILE);
    fs::rename(&db_path, &migrated)?;
    let backup_dir = root.join(LEGACY_BACKUP_DIR);
    fs::create_dir_all(&backup_dir)?;
    fs::copy(&migrated, backup_dir.join(MIGRATED_STORE_FILE))?;

    info!(imported, "imported legacy store");
    Ok(imported)
}

/// Map one sqlite row onto a [`LegacyRow`]. Rows this engine cannot
/// represent (non-text keys, values lost on disk) are skipped with a
/// warning rather than failing the whole migration.
fn decode_row(root: &Path, row: &rusqlite::Row<'_>) -> CacheResult<Option<LegacyRow>> {
    let get = |idx: usize| {
        row.get_ref(idx)
            .map_err(|e| CacheError::migration_failed(format!("legacy column {idx}: {e}")))
    };

    let key = match get(0)? {
        ValueRef::Text(text) => match std::str::from_utf8(text) {
            Ok(text) => text.to_string(),
            Err(_) => {
                warn!("skipping legacy row with non-UTF-8 key");
                return Ok(None);
            }
        },
        ValueRef::Blob(blob) => match std::str::from_utf8(blob) {
            Ok(text) => text.to_string(),
            Err(_) => {
                warn!("skipping legacy row with non-UTF-8 key");
                return Ok(None);
            }
        },
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(n) => n.to_string(),
        ValueRef::Null => {
            warn!("skipping legacy row with NULL key");
            return Ok(None);
        }
    };

    let value = match get(1)? {
        ValueRef::Blob(blob) => blob.to_vec(),
        ValueRef::Text(text) => text.to_vec(),
        // Counters stay counters: the canonical little-endian encoding.
        ValueRef::Integer(n) => n.to_le_bytes().to_vec(),
        ValueRef::Real(n) => n.to_string().into_bytes(),
        ValueRef::Null => {
            // Value spilled to a side file by the legacy store.
            let ValueRef::Text(name) = get(2)? else {
                warn!(%key, "skipping legacy row with no value and no file");
                return Ok(None);
            };
            let name = String::from_utf8_lossy(name).to_string();
            match fs::read(root.join(&name)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%key, file = %name, error = %e, "skipping legacy row whose value file is unreadable");
                    return Ok(None);
                }
            }
        }
    };

    let expires_at = match get(3)? {
        ValueRef::Real(seconds) if seconds > 0.0 => Some(seconds as u64),
        ValueRef::Integer(seconds) if seconds > 0 => Some(seconds as u64),
        _ => None,
    };

    let tags = match get(4)? {
        ValueRef::Text(text) => sanitize_tag(std::str::from_utf8(text).unwrap_or_default()),
        ValueRef::Blob(blob) => sanitize_tag(std::str::from_utf8(blob).unwrap_or_default()),
        _ => Vec::new(),
    };

    Ok(Some(LegacyRow {
        key,
        value,
        expires_at,
        tags,
    }))
}

/// Legacy tags have no length discipline; clamp instead of refusing.
fn sanitize_tag(tag: &str) -> Vec<String> {
    if tag.is_empty() {
        return Vec::new();
    }
    vec![tag.chars().take(MAX_TAG_CHARS).collect()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_legacy_store(root: &Path) {
        let conn = Connection::open(root.join(LEGACY_STORE_FILE)).unwrap();
        conn.execute_batch(
            "CREATE TABLE Cache (
                rowid INTEGER PRIMARY KEY,
                key BLOB,
                raw INTEGER,
                store_time REAL,
                expire_time REAL,
                access_time REAL,
                access_count INTEGER DEFAULT 0,
                tag BLOB,
                size INTEGER DEFAULT 0,
                mode INTEGER DEFAULT 0,
                filename TEXT,
                value BLOB
            )",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Cache (key, value, expire_time, tag) VALUES (?1, ?2, NULL, NULL)",
            rusqlite::params!["a", &b"alpha"[..]],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Cache (key, value, expire_time, tag) VALUES (?1, ?2, 4102444800.0, 'session')",
            rusqlite::params!["b", &b"beta"[..]],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO Cache (key, value) VALUES (?1, ?2)",
            rusqlite::params!["count", 7i64],
        )
        .unwrap();
    }

    #[test]
    fn detection_requires_absence_of_an_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!legacy_store_present(dir.path()));

        create_legacy_store(dir.path());
        assert!(legacy_store_present(dir.path()));

        fs::write(dir.path().join(LIVE_LOG_NAME), b"").unwrap();
        assert!(!legacy_store_present(dir.path()));
    }

    #[test]
    fn rows_are_replayed_and_store_is_parked() {
        let dir = tempfile::tempdir().unwrap();
        create_legacy_store(dir.path());

        let mut rows = Vec::new();
        let imported = import_legacy_store(dir.path(), |row| {
            rows.push(row);
            Ok(())
        })
        .unwrap();

        assert_eq!(imported, 3);
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[0].value, b"alpha");
        assert_eq!(rows[0].expires_at, None);
        assert_eq!(rows[1].key, "b");
        assert_eq!(rows[1].expires_at, Some(4_102_444_800));
        assert_eq!(rows[1].tags, vec!["session".to_string()]);
        assert_eq!(rows[2].key, "count");
        assert_eq!(rows[2].value, 7i64.to_le_bytes().to_vec());

        // Parked and archived; a second open will not re-migrate.
        assert!(!dir.path().join(LEGACY_STORE_FILE).exists());
        assert!(dir.path().join(MIGRATED_STORE_FILE).exists());
        assert!(dir
            .path()
            .join(LEGACY_BACKUP_DIR)
            .join(MIGRATED_STORE_FILE)
            .exists());
        assert!(!legacy_store_present(dir.path()));
    }

    #[test]
    fn sink_failure_leaves_the_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        create_legacy_store(dir.path());

        let result = import_legacy_store(dir.path(), |_| {
            Err(CacheError::IOError(std::io::Error::other("disk full")))
        });
        assert!(matches!(result, Err(CacheError::MigrationFailed { .. })));
        assert!(dir.path().join(LEGACY_STORE_FILE).exists());
        assert!(!dir.path().join(MIGRATED_STORE_FILE).exists());
    }

    #[test]
    fn unreadable_store_fails_migration() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LEGACY_STORE_FILE), b"not a database").unwrap();
        let result = import_legacy_store(dir.path(), |_| Ok(()));
        assert!(matches!(result, Err(CacheError::MigrationFailed { .. })));
        assert!(dir.path().join(LEGACY_STORE_FILE).exists());
    }
}
