//! Wires the five core crates into a running daemon: loads configuration,
//! opens the baseline store, builds the orchestrator and watcher (resolving
//! their mutual reference through a [`OnceLock`]), starts the control
//! channel, and runs the main loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use baseline_store::BaselineStore;
use control_channel::ControlChannel;
use integrity_engine::{IntegrityEngine, RansomwareThresholds};
use mode_manager::ModeManager;
use recovery_engine::RecoveryEngine;
use serde_json::json;
use watcher::Watcher;

use crate::config::{self, SystemConfig};
use crate::ipc_handlers::{self, HandlerContext};
use crate::logging::{self, EventType};
use crate::orchestrator::{Notifier, Orchestrator};
use crate::stats::Stats;

pub struct GuardDaemon {
    config: SystemConfig,
    watcher: Arc<Watcher>,
    mode_manager: Arc<ModeManager>,
    control_channel: Arc<ControlChannel>,
    running: Arc<AtomicBool>,
}

impl GuardDaemon {
    /// Runs the eight-step startup sequence: config, logging, storage,
    /// integrity engine, recovery engine, mode manager, watcher, control
    /// channel. Refuses to start if the baseline store fails its internal
    /// consistency check.
    pub async fn initialize(config_path: PathBuf) -> anyhow::Result<(Self, tracing_appender::non_blocking::WorkerGuard)> {
        let config = config::load(&config_path)?;

        let guard = logging::init(Path::new(&config.log_path))?;
        logging::emit(EventType::SystemStart, "*", "secure-fs-guard starting");

        let store = Arc::new(BaselineStore::open(&config.storage_path)?);
        let (ok, message) = store.verify_self_integrity()?;
        if !ok {
            anyhow::bail!("baseline store failed its self-integrity check: {message}");
        }
        tracing::info!(files = store.count()?, "baseline store opened");

        let thresholds = RansomwareThresholds {
            files_count_threshold: config.ransomware_thresholds.files_count,
            block_change_threshold: config.ransomware_thresholds.block_change_percent,
            entropy_threshold: config.ransomware_thresholds.entropy_threshold,
        };
        let engine = Arc::new(IntegrityEngine::new(thresholds));

        let backup_dir = Path::new(&config.storage_path).join("backups");
        let quarantine_dir = Path::new(&config.storage_path).join("quarantine");
        let recovery = Arc::new(RecoveryEngine::new(backup_dir, quarantine_dir)?);

        let allowed_admins = config.allowed_admins.iter().cloned().collect();
        let mode_manager = Arc::new(ModeManager::new(allowed_admins));

        let stats = Arc::new(Stats::default());
        let running = Arc::new(AtomicBool::new(true));

        let control_channel_slot: Arc<OnceLock<Arc<ControlChannel>>> = Arc::new(OnceLock::new());
        let orchestrator_slot: Arc<OnceLock<Orchestrator>> = Arc::new(OnceLock::new());

        let watcher = {
            let orchestrator_slot = orchestrator_slot.clone();
            Arc::new(Watcher::new(
                config.protected_paths.iter().map(PathBuf::from).collect(),
                config.monitoring.use_kernel_notifications,
                Duration::from_secs(config.monitoring.fallback_interval_sec),
                move |event| {
                    if let Some(orchestrator) = orchestrator_slot.get() {
                        orchestrator.handle_watch_event(event);
                    }
                },
            ))
        };

        let notifier: Arc<Notifier> = {
            let control_channel_slot = control_channel_slot.clone();
            let rt_handle = tokio::runtime::Handle::current();
            Arc::new(move |kind: &str, data: serde_json::Value| {
                let Some(channel) = control_channel_slot.get().cloned() else { return };
                let kind = kind.to_string();
                rt_handle.spawn(async move {
                    channel.broadcast_notification(&kind, data).await;
                });
            })
        };

        let orchestrator = Orchestrator::new(
            store.clone(),
            engine.clone(),
            recovery.clone(),
            mode_manager.clone(),
            watcher.clone(),
            stats.clone(),
            config.ransomware_thresholds.time_window_sec,
            notifier,
        );
        orchestrator_slot
            .set(orchestrator)
            .unwrap_or_else(|_| unreachable!("orchestrator slot set exactly once"));

        let handler_ctx = Arc::new(HandlerContext {
            store: store.clone(),
            engine: engine.clone(),
            recovery: recovery.clone(),
            mode_manager: mode_manager.clone(),
            watcher: watcher.clone(),
            orchestrator: orchestrator_slot,
            control_channel: control_channel_slot.clone(),
            rt_handle: tokio::runtime::Handle::current(),
            config: Arc::new(Mutex::new(config.clone())),
            config_path: config_path.clone(),
            stats: stats.clone(),
            running: running.clone(),
        });
        let command_handler = ipc_handlers::build_handler(handler_ctx);

        let control_channel = Arc::new(ControlChannel::new(config.control_socket_path.clone(), command_handler));
        control_channel_slot
            .set(control_channel.clone())
            .unwrap_or_else(|_| unreachable!("control channel slot set exactly once"));

        Ok((
            Self {
                config,
                watcher,
                mode_manager,
                control_channel,
                running,
            },
            guard,
        ))
    }

    /// Starts the watcher and the control channel's accept loop, then blocks
    /// running the session-cleanup ticker until `shutdown()` flips the
    /// running flag (via a signal handler or the control channel).
    pub async fn run(&self) -> anyhow::Result<()> {
        self.watcher.start()?;
        logging::emit(EventType::SystemStart, "*", "monitoring active");

        let control_channel = self.control_channel.clone();
        let serve_handle = tokio::spawn(async move {
            if let Err(e) = control_channel.serve().await {
                tracing::error!(error = %e, "control channel stopped unexpectedly");
            }
        });

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.mode_manager.cleanup_expired_sessions();
        }

        serve_handle.abort();
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        logging::emit(EventType::SystemStop, "*", "shutting down");
        self.watcher.stop();
        logging::emit(EventType::SystemStop, "*", "stopped");
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn status_summary(&self) -> serde_json::Value {
        json!({
            "protected_paths": self.config.protected_paths.len(),
            "mode": format!("{:?}", self.mode_manager.get_status().current),
        })
    }
}
