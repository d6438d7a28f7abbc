//! Structured event emission, matching the event taxonomy of the control
//! channel's collaborator contract: `{timestamp, type, severity, path,
//! key=value...}` per entry, emitted as `tracing` fields rather than a
//! hand-rolled log line formatter.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SystemStart,
    SystemStop,
    InitModeEnabled,
    InitModeDisabled,
    UpdateModeEnabled,
    UpdateModeDisabled,
    FileAdded,
    FileVerified,
    FileModifiedAllowed,
    FileModifiedUnauthorized,
    FileRestored,
    FileBlocked,
    HashUpdated,
    BackupCreated,
    BackupRestored,
    RansomwareDetected,
    MassModificationDetected,
    EmergencyModeActivated,
    ProcessTerminated,
    ConfigChanged,
    PathAdded,
    PathRemoved,
    IpcConnected,
    IpcDisconnected,
    AdminAction,
    Error,
    Warning,
}

impl EventType {
    pub fn severity(self) -> EventSeverity {
        use EventType::*;
        match self {
            RansomwareDetected | EmergencyModeActivated => EventSeverity::Emergency,
            MassModificationDetected | FileModifiedUnauthorized | Error => EventSeverity::Critical,
            Warning | FileBlocked | ProcessTerminated => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Installs the global subscriber: an `EnvFilter`-gated console layer plus
/// a daily-rotated file layer under `log_path`'s parent directory. Returns
/// the worker guard that must be held for the life of the process — if it
/// is dropped, buffered log lines are lost.
pub fn init(log_path: &Path) -> anyhow::Result<WorkerGuard> {
    let directory = log_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "system.log".to_string());

    let rolling = tracing_appender::rolling::daily(directory, &file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(rolling);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(guard)
}

/// Emits one structured event, matching the collaborator contract
/// `{timestamp, type, severity, path, key=value...}`. `tracing` supplies
/// the timestamp at the subscriber layer.
pub fn emit(event_type: EventType, path: &str, detail: &str) {
    match event_type.severity() {
        EventSeverity::Emergency => {
            tracing::error!(event = ?event_type, path, severity = "emergency", detail)
        }
        EventSeverity::Critical => {
            tracing::error!(event = ?event_type, path, severity = "critical", detail)
        }
        EventSeverity::Warning => {
            tracing::warn!(event = ?event_type, path, severity = "warning", detail)
        }
        EventSeverity::Info => {
            tracing::info!(event = ?event_type, path, severity = "info", detail)
        }
    }
}
