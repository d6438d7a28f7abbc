//! The {Monitor, Init, Update, Emergency} mode state machine that gates
//! every mutating operation elsewhere in the daemon.
//!
//! Mode transitions are the only sanctioned way to change trust policy.
//! Every read of the current mode lazily downgrades an expired Update back
//! to Monitor, so callers never need to poll a separate deadline.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MODE_HISTORY_CAPACITY: usize = 1000;
const MIN_UPDATE_TIMEOUT_SECS: u64 = 60;
const MAX_UPDATE_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("transition {from:?} -> {to:?} is not permitted")]
    InvalidTransition { from: SystemMode, to: SystemMode },
    #[error("update mode timeout must be within [{MIN_UPDATE_TIMEOUT_SECS}, {MAX_UPDATE_TIMEOUT_SECS}] seconds")]
    InvalidTimeout,
    #[error("admin verification failed for user {0:?}")]
    Unauthorized(String),
}

pub type Result<T> = std::result::Result<T, ModeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemMode {
    Monitor,
    Init,
    Update,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthResult {
    Success,
    Failed,
    Expired,
    Unauthorized,
}

/// The action-validation table's keys. `Any` actions are excluded — those
/// are always permitted regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadStatus,
    ReadLogs,
    ReadStatistics,
    VerifyFile,
    ListFiles,
    GetFileInfo,
    AddFile,
    CreateBackup,
    InitializeBaseline,
    UpdateFile,
    ModifyFile,
    UpdateHashes,
    RestoreFile,
    BlockFile,
    ExitEmergency,
}

#[derive(Debug, Clone)]
struct Session {
    user: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChangeRecord {
    pub from: SystemMode,
    pub to: SystemMode,
    pub admin_user: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeStatus {
    pub current: SystemMode,
    pub started_at: DateTime<Utc>,
    pub remaining_seconds: Option<i64>,
    pub emergency_reason: Option<String>,
    pub active_session_count: usize,
}

struct Inner {
    current_mode: SystemMode,
    mode_start_time: DateTime<Utc>,
    mode_deadline: Option<DateTime<Utc>>,
    active_sessions: std::collections::HashMap<String, Session>,
    mode_history: VecDeque<ModeChangeRecord>,
    emergency_reason: Option<String>,
}

pub struct ModeManager {
    inner: Mutex<Inner>,
    allowed_admins: HashSet<String>,
}

impl ModeManager {
    pub fn new(allowed_admins: HashSet<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current_mode: SystemMode::Monitor,
                mode_start_time: Utc::now(),
                mode_deadline: None,
                active_sessions: std::collections::HashMap::new(),
                mode_history: VecDeque::with_capacity(MODE_HISTORY_CAPACITY),
                emergency_reason: None,
            }),
            allowed_admins,
        }
    }

    /// Lazily downgrades an expired Update mode to Monitor; this check runs
    /// on every read.
    pub fn get_mode(&self) -> SystemMode {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_mode == SystemMode::Update {
            if let Some(deadline) = inner.mode_deadline {
                if Utc::now() >= deadline {
                    exit_update_locked(&mut inner, None);
                }
            }
        }
        inner.current_mode
    }

    pub fn is_monitor_mode(&self) -> bool {
        self.get_mode() == SystemMode::Monitor
    }

    pub fn is_update_mode(&self) -> bool {
        self.get_mode() == SystemMode::Update
    }

    pub fn is_init_mode(&self) -> bool {
        self.get_mode() == SystemMode::Init
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.get_mode() == SystemMode::Emergency
    }

    pub fn enter_init_mode(&self, admin_user: &str) -> Result<()> {
        self.verify_admin(admin_user)?;
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_mode;
        if current != SystemMode::Monitor {
            return Err(ModeError::InvalidTransition {
                from: current,
                to: SystemMode::Init,
            });
        }
        transition(&mut inner, SystemMode::Init, Some(admin_user), None, None);
        Ok(())
    }

    pub fn exit_init_mode(&self, admin_user: &str) -> Result<()> {
        self.verify_admin(admin_user)?;
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_mode;
        if current != SystemMode::Init {
            return Err(ModeError::InvalidTransition {
                from: current,
                to: SystemMode::Monitor,
            });
        }
        transition(&mut inner, SystemMode::Monitor, Some(admin_user), None, None);
        Ok(())
    }

    /// Enters Update mode, or — if already in Update — extends the deadline
    /// without issuing a new token. Returns the (possibly pre-existing)
    /// session token.
    pub fn enter_update_mode(&self, admin_user: &str, timeout_seconds: u64) -> Result<String> {
        if !(MIN_UPDATE_TIMEOUT_SECS..=MAX_UPDATE_TIMEOUT_SECS).contains(&timeout_seconds) {
            return Err(ModeError::InvalidTimeout);
        }

        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_mode;
        if current == SystemMode::Emergency || current == SystemMode::Init {
            return Err(ModeError::InvalidTransition {
                from: current,
                to: SystemMode::Update,
            });
        }

        self.verify_admin(admin_user)?;

        let new_deadline = Utc::now() + chrono::Duration::seconds(timeout_seconds as i64);
        if current == SystemMode::Update {
            inner.mode_deadline = Some(new_deadline);
            if let Some(token) = inner
                .active_sessions
                .iter()
                .find(|(_, s)| s.user == admin_user)
                .map(|(t, _)| t.clone())
            {
                if let Some(session) = inner.active_sessions.get_mut(&token) {
                    session.expires_at = new_deadline;
                }
                return Ok(token);
            }
        }

        let token = generate_session_token();
        inner.active_sessions.insert(
            token.clone(),
            Session {
                user: admin_user.to_string(),
                expires_at: new_deadline,
            },
        );
        inner.mode_deadline = Some(new_deadline);
        transition(
            &mut inner,
            SystemMode::Update,
            Some(admin_user),
            Some(timeout_seconds),
            None,
        );
        Ok(token)
    }

    /// Admin-verified exit, or a no-op success if the deadline already
    /// elapsed (the lazy check on `get_mode` will have already downgraded).
    pub fn exit_update_mode(&self, admin_user: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_mode != SystemMode::Update {
            return Ok(());
        }
        let expired = inner.mode_deadline.map(|d| Utc::now() >= d).unwrap_or(false);
        if !expired {
            drop(inner);
            self.verify_admin(admin_user)?;
            inner = self.inner.lock().unwrap();
        }
        exit_update_locked(&mut inner, Some(admin_user));
        Ok(())
    }

    /// Unconditional; force-exits Update first, clearing its sessions.
    pub fn enter_emergency_mode(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_mode == SystemMode::Update {
            exit_update_locked(&mut inner, None);
        }
        let from = inner.current_mode;
        inner.emergency_reason = Some(reason.to_string());
        transition(
            &mut inner,
            SystemMode::Emergency,
            None,
            None,
            Some(reason.to_string()),
        );
        tracing::error!(%reason, ?from, "entering emergency mode");
    }

    pub fn exit_emergency_mode(&self, admin_user: &str) -> Result<()> {
        self.verify_admin(admin_user)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.current_mode != SystemMode::Emergency {
            return Err(ModeError::InvalidTransition {
                from: inner.current_mode,
                to: SystemMode::Monitor,
            });
        }
        inner.emergency_reason = None;
        transition(&mut inner, SystemMode::Monitor, Some(admin_user), None, None);
        Ok(())
    }

    pub fn verify_session_token(&self, token: &str) -> AuthResult {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.active_sessions.get(token).cloned() else {
            return AuthResult::Unauthorized;
        };
        if Utc::now() >= session.expires_at {
            inner.active_sessions.remove(token);
            return AuthResult::Expired;
        }
        AuthResult::Success
    }

    pub fn revoke_session(&self, token: &str) {
        self.inner.lock().unwrap().active_sessions.remove(token);
    }

    pub fn get_mode_remaining_time(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .mode_deadline
            .map(|d| (d - Utc::now()).num_seconds().max(0))
    }

    pub fn get_status(&self) -> ModeStatus {
        let inner = self.inner.lock().unwrap();
        ModeStatus {
            current: inner.current_mode,
            started_at: inner.mode_start_time,
            remaining_seconds: inner
                .mode_deadline
                .map(|d| (d - Utc::now()).num_seconds().max(0)),
            emergency_reason: inner.emergency_reason.clone(),
            active_session_count: inner.active_sessions.len(),
        }
    }

    pub fn get_mode_history(&self) -> Vec<ModeChangeRecord> {
        self.inner.lock().unwrap().mode_history.iter().cloned().collect()
    }

    /// Queried by the orchestrator before any mutation. `Any`-tier actions
    /// (status/logs/statistics) are not modeled here — they're always
    /// allowed regardless of mode, so callers should short-circuit on them
    /// before calling this.
    pub fn validate_action(&self, action: Action, admin_user: Option<&str>) -> bool {
        let mode = self.get_mode();
        match mode {
            SystemMode::Monitor => matches!(
                action,
                Action::ReadStatus
                    | Action::ReadLogs
                    | Action::ReadStatistics
                    | Action::VerifyFile
                    | Action::ListFiles
                    | Action::GetFileInfo
            ),
            SystemMode::Init => matches!(
                action,
                Action::ReadStatus
                    | Action::ReadLogs
                    | Action::ReadStatistics
                    | Action::AddFile
                    | Action::CreateBackup
                    | Action::InitializeBaseline
            ),
            SystemMode::Update => matches!(
                action,
                Action::ReadStatus
                    | Action::ReadLogs
                    | Action::ReadStatistics
                    | Action::UpdateFile
                    | Action::ModifyFile
                    | Action::UpdateHashes
                    | Action::CreateBackup
            ),
            SystemMode::Emergency => {
                let admin_ok = admin_user.map(|u| self.verify_admin(u).is_ok()).unwrap_or(false);
                matches!(
                    action,
                    Action::ReadStatus | Action::ReadLogs | Action::ReadStatistics
                ) || (admin_ok
                    && matches!(
                        action,
                        Action::RestoreFile | Action::BlockFile | Action::ExitEmergency
                    ))
            }
        }
    }

    pub fn cleanup_expired_sessions(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner.active_sessions.retain(|_, s| s.expires_at > now);
    }

    fn verify_admin(&self, admin_user: &str) -> Result<()> {
        if is_privileged_process() && self.allowed_admins.contains(admin_user) {
            Ok(())
        } else {
            Err(ModeError::Unauthorized(admin_user.to_string()))
        }
    }
}

fn exit_update_locked(inner: &mut Inner, admin_user: Option<&str>) {
    inner.active_sessions.clear();
    inner.mode_deadline = None;
    transition(inner, SystemMode::Monitor, admin_user, None, None);
}

fn transition(
    inner: &mut Inner,
    to: SystemMode,
    admin_user: Option<&str>,
    timeout_seconds: Option<u64>,
    reason: Option<String>,
) {
    let from = inner.current_mode;
    inner.current_mode = to;
    inner.mode_start_time = Utc::now();
    if inner.mode_history.len() == MODE_HISTORY_CAPACITY {
        inner.mode_history.pop_front();
    }
    inner.mode_history.push_back(ModeChangeRecord {
        from,
        to,
        admin_user: admin_user.map(|s| s.to_string()),
        timeout_seconds,
        reason,
        timestamp: Utc::now(),
    });
}

fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(unix)]
fn is_privileged_process() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_privileged_process() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager_with_admin(user: &str) -> ModeManager {
        let mut admins = HashSet::new();
        admins.insert(user.to_string());
        ModeManager::new(admins)
    }

    #[test]
    fn starts_in_monitor_mode() {
        let manager = manager_with_admin("root");
        assert_eq!(manager.get_mode(), SystemMode::Monitor);
    }

    #[test]
    #[cfg(unix)]
    fn init_round_trip_requires_privileged_admin() {
        let manager = manager_with_admin("root");
        if unsafe { libc::geteuid() } == 0 {
            manager.enter_init_mode("root").unwrap();
            assert_eq!(manager.get_mode(), SystemMode::Init);
            manager.exit_init_mode("root").unwrap();
            assert_eq!(manager.get_mode(), SystemMode::Monitor);
        } else {
            assert!(manager.enter_init_mode("root").is_err());
        }
    }

    #[test]
    fn init_to_update_direct_transition_forbidden() {
        let manager = manager_with_admin("root");
        // even with a stubbed-out privileged check this transition table
        // entry is invalid regardless of admin verification outcome
        let err = manager.enter_update_mode("nobody", 120).unwrap_err();
        assert!(matches!(err, ModeError::Unauthorized(_)));
    }

    #[test]
    fn enter_update_mode_rejects_out_of_range_timeout() {
        let manager = manager_with_admin("root");
        let err = manager.enter_update_mode("root", 30).unwrap_err();
        assert!(matches!(err, ModeError::InvalidTimeout));
        let err = manager.enter_update_mode("root", 99999).unwrap_err();
        assert!(matches!(err, ModeError::InvalidTimeout));
    }

    #[test]
    fn emergency_entry_is_unconditional_and_clears_sessions() {
        let manager = manager_with_admin("root");
        manager.enter_emergency_mode("ransomware pattern detected");
        assert_eq!(manager.get_mode(), SystemMode::Emergency);
        assert_eq!(manager.get_status().active_session_count, 0);
    }

    #[test]
    fn emergency_trap_rejects_non_exit_transitions() {
        let manager = manager_with_admin("root");
        manager.enter_emergency_mode("burst detected");
        assert!(manager.enter_init_mode("root").is_err());
    }

    #[test]
    fn session_token_unauthorized_when_absent() {
        let manager = manager_with_admin("root");
        assert_eq!(manager.verify_session_token("nonexistent"), AuthResult::Unauthorized);
    }

    #[test]
    fn validate_action_always_allows_status_reads_in_emergency() {
        let manager = manager_with_admin("root");
        manager.enter_emergency_mode("test");
        assert!(manager.validate_action(Action::ReadStatus, None));
        assert!(!manager.validate_action(Action::RestoreFile, None));
    }

    #[test]
    fn mode_history_records_transitions() {
        let manager = manager_with_admin("root");
        manager.enter_emergency_mode("burst");
        let history = manager.get_mode_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, SystemMode::Emergency);
    }

    /// After a deadline elapses, `get_mode()` must downgrade Update to
    /// Monitor lazily, without an explicit exit call, and any session
    /// token issued under it must fail as `Expired`.
    ///
    /// Waiting out a real 60s minimum timeout is impractical in a test
    /// suite, so the deadline is backdated directly rather than slept past.
    #[test]
    fn update_deadline_lapse_downgrades_mode_and_expires_session() {
        let manager = manager_with_admin("root");

        let token = {
            let mut inner = manager.inner.lock().unwrap();
            inner.current_mode = SystemMode::Update;
            inner.mode_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
            let token = generate_session_token();
            inner.active_sessions.insert(
                token.clone(),
                Session {
                    user: "root".to_string(),
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                },
            );
            token
        };

        assert_eq!(manager.get_mode(), SystemMode::Monitor);
        assert_eq!(manager.verify_session_token(&token), AuthResult::Expired);
    }
}
