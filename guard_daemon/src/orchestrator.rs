//! Binds watcher events to a mode gate, baseline lookup, integrity
//! verification, and the resulting recovery or escalation action.
//!
//! Holds only non-owning references to the five leaf crates; none of them
//! refer back to the orchestrator. Wiring is one-directional. Every event
//! is handled inside a catch-all boundary — a single file's error never
//! kills the watcher's dispatch thread.

use std::path::Path;
use std::sync::Arc;

use baseline_store::{BaselineStore, FileRecord};
use chrono::Utc;
use integrity_engine::{ChangeType, IntegrityEngine, IntegrityError};
use mode_manager::ModeManager;
use recovery_engine::RecoveryEngine;
use watcher::{WatchEvent, WatchEventType, Watcher};

use crate::logging::{self, EventType};
use crate::stats::Stats;

pub type Notifier = dyn Fn(&str, serde_json::Value) + Send + Sync + 'static;

pub struct Orchestrator {
    store: Arc<BaselineStore>,
    engine: Arc<IntegrityEngine>,
    recovery: Arc<RecoveryEngine>,
    mode_manager: Arc<ModeManager>,
    watcher: Arc<Watcher>,
    stats: Arc<Stats>,
    time_window_sec: i64,
    notifier: Arc<Notifier>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<BaselineStore>,
        engine: Arc<IntegrityEngine>,
        recovery: Arc<RecoveryEngine>,
        mode_manager: Arc<ModeManager>,
        watcher: Arc<Watcher>,
        stats: Arc<Stats>,
        time_window_sec: i64,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            engine,
            recovery,
            mode_manager,
            watcher,
            stats,
            time_window_sec,
            notifier,
        }
    }

    /// The watcher's single dispatch handler. Never propagates an error —
    /// catches and logs instead, per the error-handling policy that the
    /// watcher thread must never die from a single file's failure.
    pub fn handle_watch_event(&self, event: WatchEvent) {
        let record = match self.store.get(&event.file_path) {
            Ok(Some(record)) => record,
            Ok(None) => return, // not under protection
            Err(e) => {
                logging::emit(EventType::Error, &event.file_path, &format!("baseline lookup failed: {e}"));
                return;
            }
        };

        match event.event_type {
            WatchEventType::Modify => self.handle_modification(&event.file_path, &record),
            WatchEventType::Delete => self.handle_deletion(&event.file_path, &record),
            WatchEventType::Create | WatchEventType::Move => {}
        }
    }

    fn handle_modification(&self, path: &str, record: &FileRecord) {
        let is_update_mode = self.mode_manager.is_update_mode();
        let result = match self.checked_integrity(path, record, is_update_mode) {
            Some(r) => r,
            None => return,
        };
        self.stats.record_file_checked();

        match result.classification {
            ChangeType::NoChange => {
                logging::emit(EventType::FileVerified, path, "integrity verified");
            }
            ChangeType::AllowedChange => {
                self.update_baseline(path);
                logging::emit(EventType::FileModifiedAllowed, path, "change absorbed in update mode");
            }
            ChangeType::CriticalChange | ChangeType::SuspiciousChange | ChangeType::UnauthorizedChange => {
                self.stats.record_violation();
                logging::emit(
                    EventType::FileModifiedUnauthorized,
                    path,
                    &format!("{:?}: {}", result.classification, result.message),
                );
                self.handle_violation(path, record, result.classification, &result.changed_indices);
            }
        }
    }

    /// Retries once locally on transient I/O, per the error-handling table;
    /// permission failures surface as a warning without being treated as a
    /// violation, since the file could not be verified at all.
    fn checked_integrity(
        &self,
        path: &str,
        record: &FileRecord,
        is_update_mode: bool,
    ) -> Option<integrity_engine::IntegrityCheckResult> {
        let attempt = self.engine.check_integrity(
            Path::new(path),
            &record.block_hashes,
            record.block_size,
            is_update_mode,
        );
        match attempt {
            Ok(result) => Some(result),
            Err(IntegrityError::PermissionDenied(_)) => {
                logging::emit(EventType::Warning, path, "permission denied, cannot verify");
                None
            }
            Err(IntegrityError::FileNotFound(_)) => {
                // check_integrity converts this to an Ok(CriticalChange) itself;
                // reaching here would mean the file vanished between hashing
                // attempts. Treat identically to the deletion path.
                self.handle_deletion(path, record);
                None
            }
            Err(e @ IntegrityError::Io { .. }) => {
                match self.engine.check_integrity(
                    Path::new(path),
                    &record.block_hashes,
                    record.block_size,
                    is_update_mode,
                ) {
                    Ok(result) => Some(result),
                    Err(_) => {
                        logging::emit(EventType::Warning, path, &format!("transient io error: {e}"));
                        None
                    }
                }
            }
        }
    }

    fn handle_violation(&self, path: &str, record: &FileRecord, classification: ChangeType, changed_indices: &[usize]) {
        let detection = self.engine.detect_ransomware_pattern(self.time_window_sec);
        if detection.detected {
            self.handle_ransomware_attack(&detection);
            return;
        }

        let Some(backup) = record.backup_path.as_ref() else {
            logging::emit(EventType::Warning, path, "violation detected but no backup exists");
            return;
        };

        let restored = if classification == ChangeType::CriticalChange {
            self.recovery.restore_from_backup(Path::new(path), Path::new(backup))
        } else {
            self.recovery
                .restore_blocks(Path::new(path), Path::new(backup), changed_indices, record.block_size)
        };

        match restored {
            Ok(()) => {
                self.stats.record_file_restored();
                logging::emit(EventType::FileRestored, path, "restored after unauthorized change");
            }
            Err(e) => {
                logging::emit(EventType::Error, path, &format!("restore failed: {e}"));
            }
        }

        self.notifier.as_ref()(
            "violation_detected",
            serde_json::json!({ "path": path, "classification": format!("{:?}", classification) }),
        );
    }

    fn handle_ransomware_attack(&self, detection: &integrity_engine::RansomwareDetection) {
        self.stats.record_ransomware_detected();
        let reason = format!(
            "{} files affected, mean change {:.1}%, {} critical",
            detection.files_affected, detection.mean_change_percent, detection.critical_count
        );
        logging::emit(EventType::RansomwareDetected, "*", &reason);

        self.mode_manager.enter_emergency_mode(&reason);
        self.watcher.pause();

        let all_paths = self.store.list_paths().unwrap_or_default();
        let (blocked, errors) = self.recovery.emergency_block_all(&all_paths);
        logging::emit(
            EventType::EmergencyModeActivated,
            "*",
            &format!("blocked {blocked} files, {errors} errors"),
        );

        self.notifier.as_ref()(
            "ransomware_detected",
            serde_json::json!({ "reason": reason, "blocked": blocked, "errors": errors }),
        );
    }

    fn handle_deletion(&self, path: &str, record: &FileRecord) {
        if self.mode_manager.is_update_mode() {
            logging::emit(EventType::FileModifiedAllowed, path, "deletion allowed in update mode");
            return;
        }

        let Some(backup) = record.backup_path.as_ref() else {
            logging::emit(EventType::Warning, path, "deleted file has no backup to restore from");
            return;
        };

        match self.recovery.restore_from_backup(Path::new(path), Path::new(backup)) {
            Ok(()) => {
                self.stats.record_file_restored();
                logging::emit(EventType::FileRestored, path, "restored after unauthorized deletion");
            }
            Err(e) => logging::emit(EventType::Error, path, &format!("restore after deletion failed: {e}")),
        }
    }

    fn update_baseline(&self, path: &str) {
        let Ok((hashes, size)) = integrity_engine::compute_file_hashes(Path::new(path), default_block_size(&self.store, path)) else {
            logging::emit(EventType::Error, path, "could not rehash file for baseline update");
            return;
        };
        let backup = self.recovery.create_backup(Path::new(path)).ok();
        if let Some(backup) = &backup {
            logging::emit(EventType::BackupCreated, path, &backup.to_string_lossy());
        }
        match self.store.update(path, size, &hashes, backup.as_deref().and_then(|p| p.to_str())) {
            Ok(()) => logging::emit(EventType::HashUpdated, path, "baseline refreshed"),
            Err(e) => logging::emit(EventType::Error, path, &format!("baseline update failed: {e}")),
        }
    }

    /// Computes a fresh baseline record for `path` and stores it. Called
    /// only while in Init mode, mirroring the action-validation table.
    pub fn initialize_baseline(&self, path: &str, block_size: u32) -> anyhow::Result<()> {
        let (hashes, size) = integrity_engine::compute_file_hashes(Path::new(path), block_size)?;
        let backup = self.recovery.create_backup(Path::new(path))?;
        let now = Utc::now();
        let record = FileRecord {
            file_path: path.to_string(),
            file_size: size,
            block_size,
            blocks_count: hashes.len() as u64,
            block_hashes: hashes,
            created_at: now,
            updated_at: now,
            is_trusted: true,
            backup_path: backup.to_str().map(|s| s.to_string()),
        };
        self.store.add_or_replace(&record)?;
        logging::emit(EventType::FileAdded, path, "baseline initialized");
        Ok(())
    }
}

fn default_block_size(store: &BaselineStore, path: &str) -> u32 {
    store
        .get(path)
        .ok()
        .flatten()
        .map(|r| r.block_size)
        .unwrap_or(integrity_engine::DEFAULT_BLOCK_SIZE)
}
