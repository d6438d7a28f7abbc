//! Active countermeasures: backup/restore, file locking, quarantine, and
//! process termination for files that fail integrity verification.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup not found: {0}")]
    BackupNotFound(PathBuf),
    #[error("process {0} not found")]
    ProcessNotFound(i32),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_path: String,
    pub created_at: chrono::DateTime<Utc>,
    pub size_bytes: u64,
}

pub struct RecoveryEngine {
    backup_dir: PathBuf,
    quarantine_dir: PathBuf,
    restore_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RecoveryEngine {
    pub fn new(backup_dir: impl AsRef<Path>, quarantine_dir: impl AsRef<Path>) -> Result<Self> {
        let backup_dir = backup_dir.as_ref().to_path_buf();
        let quarantine_dir = quarantine_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&backup_dir)?;
        std::fs::create_dir_all(&quarantine_dir)?;
        set_mode(&backup_dir, 0o700)?;
        set_mode(&quarantine_dir, 0o700)?;
        Ok(Self {
            backup_dir,
            quarantine_dir,
            restore_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Copies `src` to a content-addressable name under the backup root:
    /// `<sanitized-path>_<YYYYMMDD_HHMMSS>.backup`, mode 0o600. The source's
    /// access and modification times are carried over explicitly — unlike
    /// `shutil.copy2` in the original, `std::fs::copy` does not preserve
    /// them on its own.
    pub fn create_backup(&self, src: &Path) -> Result<PathBuf> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = format!("{}_{}.backup", sanitize_path(src), timestamp);
        let dest = self.backup_dir.join(name);
        std::fs::copy(src, &dest)?;
        if let Ok(metadata) = std::fs::metadata(src) {
            let _ = filetime::set_file_times(
                &dest,
                filetime::FileTime::from_last_access_time(&metadata),
                filetime::FileTime::from_last_modification_time(&metadata),
            );
        }
        set_mode(&dest, 0o600)?;
        tracing::info!(src = %src.display(), backup = %dest.display(), "backup created");
        Ok(dest)
    }

    /// Acquires a write lock on `target` (strips write bits), overwrites it
    /// with the full contents of `backup`, restores mode 0o644, releases the
    /// lock. Concurrent calls on the same target serialize on a per-path
    /// lock so the second caller blocks until the first completes.
    pub fn restore_from_backup(&self, target: &Path, backup: &Path) -> Result<()> {
        if !backup.exists() {
            return Err(RecoveryError::BackupNotFound(backup.to_path_buf()));
        }
        let lock = self.lock_for(target);
        let _guard = lock.lock().unwrap();

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if target.exists() {
            strip_write_bits(target)?;
        }
        std::fs::copy(backup, target)?;
        set_mode(target, 0o644)?;
        tracing::info!(target = %target.display(), backup = %backup.display(), "restored from backup");
        Ok(())
    }

    /// For each index (ascending), seeks to `index * block_size` in both
    /// files and copies the backup's block into the target. After all
    /// indices are written, the target is unconditionally truncated to the
    /// backup's total length — even when only interior blocks were
    /// requested, per the preserved length-reset semantics. Degrades to a
    /// full restore if the target does not exist.
    pub fn restore_blocks(
        &self,
        target: &Path,
        backup: &Path,
        indices: &[usize],
        block_size: u32,
    ) -> Result<()> {
        if !target.exists() {
            return self.restore_from_backup(target, backup);
        }
        let lock = self.lock_for(target);
        let _guard = lock.lock().unwrap();

        let mut backup_file = std::fs::File::open(backup)?;
        let mut target_file = std::fs::OpenOptions::new().read(true).write(true).open(target)?;

        let mut sorted_indices = indices.to_vec();
        sorted_indices.sort_unstable();

        for index in sorted_indices {
            let offset = index as u64 * block_size as u64;
            backup_file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; block_size as usize];
            let mut filled = 0usize;
            loop {
                let n = backup_file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            buf.truncate(filled);
            target_file.seek(SeekFrom::Start(offset))?;
            target_file.write_all(&buf)?;
        }

        let backup_len = backup_file.metadata()?.len();
        target_file.set_len(backup_len)?;
        tracing::info!(target = %target.display(), blocks = indices.len(), "restored blocks");
        Ok(())
    }

    /// Strips user/group/other write bits. If `permanent`, also attempts to
    /// set the platform immutable attribute via `chattr +i`, tolerating its
    /// absence (falls back to chmod-only).
    pub fn block_file(&self, path: &Path, permanent: bool) -> Result<()> {
        strip_write_bits(path)?;
        if permanent {
            try_chattr(path, true);
        }
        tracing::info!(path = %path.display(), permanent, "file blocked");
        Ok(())
    }

    pub fn unblock_file(&self, path: &Path) -> Result<()> {
        try_chattr(path, false);
        set_mode(path, 0o644)?;
        tracing::info!(path = %path.display(), "file unblocked");
        Ok(())
    }

    /// Moves `path` into the quarantine root under a sanitized timestamped
    /// name, mode 0o000.
    pub fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = format!("{}_{}.quarantine", sanitize_path(path), timestamp);
        let dest = self.quarantine_dir.join(name);
        std::fs::rename(path, &dest)?;
        set_mode(&dest, 0o000)?;
        tracing::warn!(path = %path.display(), quarantine = %dest.display(), "file quarantined");
        Ok(dest)
    }

    pub fn restore_from_quarantine(&self, quarantine_path: &Path, original_path: &Path) -> Result<()> {
        set_mode(quarantine_path, 0o644)?;
        if let Some(parent) = original_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(quarantine_path, original_path)?;
        tracing::info!(original = %original_path.display(), "file restored from quarantine");
        Ok(())
    }

    /// Queries `lsof -t` for open-file holders of `path`. Tolerates absence
    /// of the facility (missing binary, timeout) by returning an empty list.
    pub fn find_processes_using(&self, path: &Path) -> Vec<(i32, String)> {
        find_processes_using_lsof(path)
    }

    /// Sends SIGTERM, or SIGKILL if `force`, then verifies the process no
    /// longer exists.
    pub fn terminate(&self, pid: i32, force: bool) -> Result<()> {
        terminate_process(pid, force)
    }

    /// Best-effort permanent-block of every path; returns (blocked, errors).
    pub fn emergency_block_all(&self, paths: &[String]) -> (usize, usize) {
        let mut blocked = 0;
        let mut errors = 0;
        for path in paths {
            match self.block_file(Path::new(path), true) {
                Ok(()) => blocked += 1,
                Err(e) => {
                    tracing::warn!(path, error = %e, "emergency block failed");
                    errors += 1;
                }
            }
        }
        (blocked, errors)
    }

    /// Finds the most-recently-created backup matching `original_path`'s
    /// sanitized prefix.
    pub fn get_backup_info(&self, original_path: &str) -> Option<BackupInfo> {
        let prefix = format!("{}_", sanitize_path(Path::new(original_path)));
        let mut newest: Option<(std::time::SystemTime, PathBuf, u64)> = None;
        let entries = std::fs::read_dir(&self.backup_dir).ok()?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".backup") {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(created) = metadata.modified() else { continue };
            if newest.as_ref().map(|(t, ..)| created > *t).unwrap_or(true) {
                newest = Some((created, entry.path(), metadata.len()));
            }
        }
        let (created, path, size) = newest?;
        Some(BackupInfo {
            backup_path: path.to_string_lossy().into_owned(),
            created_at: chrono::DateTime::<Utc>::from(created),
            size_bytes: size,
        })
    }

    fn lock_for(&self, target: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.restore_locks.lock().unwrap();
        locks
            .entry(target.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn sanitize_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "_")
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn strip_write_bits(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode() & !0o222;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn strip_write_bits(_path: &Path) -> Result<()> {
    Ok(())
}

/// Best-effort; swallows failures, matching the original's tolerance of a
/// missing `chattr` facility.
fn try_chattr(path: &Path, immutable: bool) {
    let flag = if immutable { "+i" } else { "-i" };
    let result = std::process::Command::new("chattr")
        .arg(flag)
        .arg(path)
        .output();
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "chattr unavailable, chmod-only");
    }
}

#[cfg(unix)]
fn find_processes_using_lsof(path: &Path) -> Vec<(i32, String)> {
    let Ok(output) = std::process::Command::new("lsof").arg("-t").arg(path).output() else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .map(|pid| {
            let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            (pid, name)
        })
        .collect()
}

#[cfg(not(unix))]
fn find_processes_using_lsof(_path: &Path) -> Vec<(i32, String)> {
    Vec::new()
}

#[cfg(unix)]
fn terminate_process(pid: i32, force: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if !std::path::Path::new(&format!("/proc/{pid}")).exists() {
        return Err(RecoveryError::ProcessNotFound(pid));
    }
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = kill(Pid::from_raw(pid), signal);
    Ok(())
}

#[cfg(not(unix))]
fn terminate_process(_pid: i32, _force: bool) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> RecoveryEngine {
        RecoveryEngine::new(dir.path().join("backups"), dir.path().join("quarantine")).unwrap()
    }

    #[test]
    fn create_backup_copies_content() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();

        let backup = engine.create_backup(&src).unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"hello");
    }

    #[test]
    fn create_backup_preserves_modification_time() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::open(&src).unwrap().set_modified(past).unwrap();

        let backup = engine.create_backup(&src).unwrap();
        let src_mtime = std::fs::metadata(&src).unwrap().modified().unwrap();
        let backup_mtime = std::fs::metadata(&backup).unwrap().modified().unwrap();
        assert_eq!(src_mtime, backup_mtime);
    }

    #[test]
    fn restore_from_backup_overwrites_target() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let target = dir.path().join("a.txt");
        std::fs::write(&target, b"original").unwrap();
        let backup = engine.create_backup(&target).unwrap();
        std::fs::write(&target, b"corrupted").unwrap();

        engine.restore_from_backup(&target, &backup).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
    }

    #[test]
    fn restore_blocks_truncates_to_backup_length_even_for_partial_restore() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let target = dir.path().join("a.bin");
        let mut f = std::fs::File::create(&target).unwrap();
        f.write_all(&[0xAAu8; 8]).unwrap();
        let backup = engine.create_backup(&target).unwrap();

        // Extend the target past the backup's length, then restore only block 0.
        let mut f = std::fs::OpenOptions::new().append(true).open(&target).unwrap();
        f.write_all(&[0xBBu8; 8]).unwrap();
        drop(f);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 16);

        engine.restore_blocks(&target, &backup, &[0], 4).unwrap();
        let restored = std::fs::read(&target).unwrap();
        assert_eq!(restored.len(), 8, "target must be truncated to backup length");
        assert_eq!(&restored[0..4], &[0xAAu8; 4]);
    }

    #[test]
    fn restore_blocks_degrades_to_full_restore_when_target_missing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let target = dir.path().join("a.bin");
        std::fs::write(&target, [0xAAu8; 8]).unwrap();
        let backup = engine.create_backup(&target).unwrap();
        std::fs::remove_file(&target).unwrap();

        engine.restore_blocks(&target, &backup, &[0], 4).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), [0xAAu8; 8]);
    }

    #[test]
    fn quarantine_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"data").unwrap();

        let quarantined = engine.quarantine(&path).unwrap();
        assert!(!path.exists());
        engine.restore_from_quarantine(&quarantined, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn get_backup_info_returns_newest_matching_backup() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"v1").unwrap();
        engine.create_backup(&path).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, b"v2-longer").unwrap();
        engine.create_backup(&path).unwrap();

        let info = engine.get_backup_info(path.to_str().unwrap()).unwrap();
        assert_eq!(info.size_bytes, 9);
    }

    #[test]
    fn emergency_block_all_counts_successes_and_failures() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let ok_path = dir.path().join("ok.txt");
        std::fs::write(&ok_path, b"x").unwrap();
        let missing_path = dir.path().join("missing.txt");

        let (blocked, errors) = engine.emergency_block_all(&[
            ok_path.to_string_lossy().into_owned(),
            missing_path.to_string_lossy().into_owned(),
        ]);
        assert_eq!(blocked, 1);
        assert_eq!(errors, 1);
    }
}
