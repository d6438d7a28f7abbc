//! Durable mapping from protected file path to its block-hash vector.
//!
//! Backed by an embedded SQLite database with two tables, `files` and
//! `block_hashes`, joined on `file_id`. All mutating operations run inside
//! a transaction so a crash mid-write never leaves a torn hash vector.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no record for path {0}")]
    NotFound(String),
    #[error("record invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One row per protected file, with its ordered vector of block hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub file_path: String,
    pub file_size: u64,
    pub block_size: u32,
    pub blocks_count: u64,
    pub block_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_trusted: bool,
    pub backup_path: Option<String>,
}

impl FileRecord {
    /// `blocks_count == ceil(file_size / block_size)`, 0 for an empty file.
    pub fn expected_blocks_count(file_size: u64, block_size: u32) -> u64 {
        if file_size == 0 {
            return 0;
        }
        (file_size + block_size as u64 - 1) / block_size as u64
    }

    fn check_invariants(&self) -> Result<()> {
        if self.block_hashes.len() as u64 != self.blocks_count {
            return Err(StorageError::Invariant(format!(
                "block_hashes length {} != blocks_count {}",
                self.block_hashes.len(),
                self.blocks_count
            )));
        }
        let expected = Self::expected_blocks_count(self.file_size, self.block_size);
        if expected != self.blocks_count {
            return Err(StorageError::Invariant(format!(
                "blocks_count {} != ceil(file_size/block_size) = {}",
                self.blocks_count, expected
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total: u64,
    pub trusted: u64,
    pub total_bytes: u64,
    pub total_blocks: u64,
    pub store_bytes: u64,
}

pub struct BaselineStore {
    conn: Mutex<Connection>,
    storage_dir: PathBuf,
    db_path: PathBuf,
}

impl BaselineStore {
    /// Opens (creating if needed) the store under `storage_dir/hashes.db`.
    ///
    /// The storage directory is created with mode 0o700 and the database
    /// file with mode 0o600, matching the protected-state layout.
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        set_dir_mode(&storage_dir, 0o700)?;

        let db_path = storage_dir.join("hashes.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        set_file_mode(&db_path, 0o600)?;

        Ok(Self {
            conn: Mutex::new(conn),
            storage_dir,
            db_path,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Upserts metadata and atomically replaces the full block-hash vector.
    ///
    /// Retries once on a uniqueness-violation raced with a concurrent
    /// insert of the same path before giving up.
    pub fn add_or_replace(&self, record: &FileRecord) -> Result<()> {
        record.check_invariants()?;
        match self.add_or_replace_once(record) {
            Ok(()) => Ok(()),
            Err(StorageError::Sqlite(e)) if is_uniqueness_violation(&e) => {
                self.add_or_replace_once(record)
            }
            Err(e) => Err(e),
        }
    }

    fn add_or_replace_once(&self, record: &FileRecord) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO files (file_path, file_size, block_size, blocks_count, created_at, updated_at, is_trusted, backup_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
             ON CONFLICT(file_path) DO UPDATE SET
                file_size = excluded.file_size,
                block_size = excluded.block_size,
                blocks_count = excluded.blocks_count,
                updated_at = excluded.updated_at,
                is_trusted = excluded.is_trusted,
                backup_path = excluded.backup_path",
            params![
                record.file_path,
                record.file_size,
                record.block_size,
                record.blocks_count,
                record.updated_at.to_rfc3339(),
                record.is_trusted,
                record.backup_path,
            ],
        )?;
        let file_id: i64 = tx.query_row(
            "SELECT id FROM files WHERE file_path = ?1",
            params![record.file_path],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM block_hashes WHERE file_id = ?1",
            params![file_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO block_hashes (file_id, block_index, hash_value) VALUES (?1, ?2, ?3)",
            )?;
            for (index, hash) in record.block_hashes.iter().enumerate() {
                stmt.execute(params![file_id, index as i64, hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns a consistent snapshot including hashes in block-index order.
    pub fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, file_path, file_size, block_size, blocks_count, created_at, updated_at, is_trusted, backup_path
                 FROM files WHERE file_path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((file_id, file_path, file_size, block_size, blocks_count, created_at, updated_at, is_trusted, backup_path)) = row
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT hash_value FROM block_hashes WHERE file_id = ?1 ORDER BY block_index ASC",
        )?;
        let block_hashes = stmt
            .query_map(params![file_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(FileRecord {
            file_path,
            file_size: file_size as u64,
            block_size: block_size as u32,
            blocks_count: blocks_count as u64,
            block_hashes,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
            is_trusted,
            backup_path,
        }))
    }

    /// Fails with `NotFound` if no record exists; preserves `created_at`.
    pub fn update(
        &self,
        path: &str,
        new_size: u64,
        new_hashes: &[String],
        new_backup: Option<&str>,
    ) -> Result<()> {
        let existing = self.get(path)?.ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let record = FileRecord {
            file_path: path.to_string(),
            file_size: new_size,
            block_size: existing.block_size,
            blocks_count: new_hashes.len() as u64,
            block_hashes: new_hashes.to_vec(),
            created_at: existing.created_at,
            updated_at: Utc::now(),
            is_trusted: true,
            backup_path: new_backup.map(|s| s.to_string()).or(existing.backup_path),
        };
        self.add_or_replace(&record)
    }

    /// Cascades to `block_hashes` via the foreign-key `ON DELETE CASCADE`.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM files WHERE file_path = ?1", params![path])?;
        Ok(affected > 0)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE file_path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT file_path FROM files ORDER BY file_path ASC")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn set_trust(&self, path: &str, flag: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE files SET is_trusted = ?1, updated_at = ?2 WHERE file_path = ?3",
            params![flag, Utc::now().to_rfc3339(), path],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.conn.lock().unwrap();
        let (total, trusted, total_bytes, total_blocks): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_trusted), 0), COALESCE(SUM(file_size), 0), COALESCE(SUM(blocks_count), 0) FROM files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        drop(conn);
        let store_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStatistics {
            total: total as u64,
            trusted: trusted as u64,
            total_bytes: total_bytes as u64,
            total_blocks: total_blocks as u64,
            store_bytes,
        })
    }

    /// Internal structural consistency check (`PRAGMA integrity_check`).
    pub fn verify_self_integrity(&self) -> Result<(bool, String)> {
        let conn = self.conn.lock().unwrap();
        let message: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok((message == "ok", message))
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT UNIQUE NOT NULL,
            file_size INTEGER NOT NULL,
            block_size INTEGER NOT NULL,
            blocks_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            is_trusted INTEGER NOT NULL DEFAULT 1,
            backup_path TEXT
         );
         CREATE TABLE IF NOT EXISTS block_hashes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            block_index INTEGER NOT NULL,
            hash_value TEXT NOT NULL,
            UNIQUE(file_id, block_index)
         );
         CREATE INDEX IF NOT EXISTS idx_block_hashes_file_id ON block_hashes(file_id);",
    )?;
    Ok(())
}

fn is_uniqueness_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(path: &str) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            file_path: path.to_string(),
            file_size: 3000,
            block_size: 1024,
            blocks_count: 3,
            block_hashes: vec!["a".repeat(64), "b".repeat(64), "c".repeat(64)],
            created_at: now,
            updated_at: now,
            is_trusted: true,
            backup_path: None,
        }
    }

    #[test]
    fn add_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let record = sample_record("/tmp/a");
        store.add_or_replace(&record).unwrap();

        let fetched = store.get("/tmp/a").unwrap().unwrap();
        assert_eq!(fetched.block_hashes, record.block_hashes);
        assert_eq!(fetched.blocks_count, 3);
    }

    #[test]
    fn replace_atomically_swaps_hash_vector() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.add_or_replace(&sample_record("/tmp/a")).unwrap();

        let mut replaced = sample_record("/tmp/a");
        replaced.block_hashes = vec!["z".repeat(64)];
        replaced.blocks_count = 1;
        replaced.file_size = 1;
        replaced.block_size = 1;
        store.add_or_replace(&replaced).unwrap();

        let fetched = store.get("/tmp/a").unwrap().unwrap();
        assert_eq!(fetched.block_hashes, vec!["z".repeat(64)]);
    }

    #[test]
    fn update_fails_when_record_missing() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let err = store.update("/tmp/missing", 0, &[], None).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn update_preserves_created_at() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let record = sample_record("/tmp/a");
        store.add_or_replace(&record).unwrap();

        store
            .update("/tmp/a", 1024, &["d".repeat(64)], None)
            .unwrap();
        let fetched = store.get("/tmp/a").unwrap().unwrap();
        assert_eq!(fetched.created_at, record.created_at);
        assert_eq!(fetched.block_hashes, vec!["d".repeat(64)]);
    }

    #[test]
    fn remove_cascades_block_hashes() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.add_or_replace(&sample_record("/tmp/a")).unwrap();
        assert!(store.remove("/tmp/a").unwrap());
        assert!(store.get("/tmp/a").unwrap().is_none());
        assert!(!store.remove("/tmp/a").unwrap());
    }

    #[test]
    fn statistics_aggregate_across_records() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        store.add_or_replace(&sample_record("/tmp/a")).unwrap();
        store.add_or_replace(&sample_record("/tmp/b")).unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.trusted, 2);
        assert_eq!(stats.total_blocks, 6);
    }

    #[test]
    fn verify_self_integrity_reports_ok_on_fresh_store() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let (ok, message) = store.verify_self_integrity().unwrap();
        assert!(ok, "expected ok, got {message}");
    }

    #[test]
    fn invariant_violation_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::open(dir.path()).unwrap();
        let mut bad = sample_record("/tmp/a");
        bad.blocks_count = 99;
        let err = store.add_or_replace(&bad).unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)));
    }
}
