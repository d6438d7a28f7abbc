//! Translates control-channel `Command`s into calls against the core
//! crates, gating every mutation through [`mode_manager::ModeManager`]'s
//! action-validation table before it touches the baseline store, watcher,
//! or recovery engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use baseline_store::BaselineStore;
use control_channel::{Command, ControlChannel, Response};
use integrity_engine::IntegrityEngine;
use mode_manager::{Action, ModeManager};
use recovery_engine::RecoveryEngine;
use serde_json::json;
use watcher::Watcher;

use crate::config::{self, SystemConfig};
use crate::logging::{self, EventType};
use crate::orchestrator::Orchestrator;
use crate::stats::Stats;

pub struct HandlerContext {
    pub store: Arc<BaselineStore>,
    pub engine: Arc<IntegrityEngine>,
    pub recovery: Arc<RecoveryEngine>,
    pub mode_manager: Arc<ModeManager>,
    pub watcher: Arc<Watcher>,
    pub orchestrator: Arc<OnceLock<Orchestrator>>,
    pub control_channel: Arc<OnceLock<Arc<ControlChannel>>>,
    pub rt_handle: tokio::runtime::Handle,
    pub config: Arc<Mutex<SystemConfig>>,
    pub config_path: PathBuf,
    pub stats: Arc<Stats>,
    pub running: Arc<AtomicBool>,
}

/// Builds the sync command handler passed to [`control_channel::ControlChannel`].
pub fn build_handler(ctx: Arc<HandlerContext>) -> impl Fn(Command) -> Response + Send + Sync + 'static {
    move |command| handle(&ctx, command)
}

fn handle(ctx: &HandlerContext, command: Command) -> Response {
    match command {
        Command::Ping => Response::ok("pong"),
        Command::GetStatus => get_status(ctx),
        Command::GetStatistics => get_statistics(ctx),
        Command::GetLogs { limit } => Response::ok(json!({ "lines_requested": limit.unwrap_or(100), "logs": [] })),

        Command::EnterInitMode { admin_user } => match ctx.mode_manager.enter_init_mode(&admin_user) {
            Ok(()) => {
                logging::emit(EventType::InitModeEnabled, "*", &admin_user);
                Response::ok_empty()
            }
            Err(e) => Response::err(e.to_string()),
        },
        Command::ExitInitMode { admin_user } => match ctx.mode_manager.exit_init_mode(&admin_user) {
            Ok(()) => {
                logging::emit(EventType::InitModeDisabled, "*", &admin_user);
                Response::ok_empty()
            }
            Err(e) => Response::err(e.to_string()),
        },
        Command::EnterUpdateMode { admin_user, timeout_seconds } => {
            match ctx.mode_manager.enter_update_mode(&admin_user, timeout_seconds) {
                Ok(token) => {
                    ctx.watcher.pause();
                    logging::emit(EventType::UpdateModeEnabled, "*", &admin_user);
                    Response::ok(json!({ "token": token }))
                }
                Err(e) => Response::err(e.to_string()),
            }
        }
        Command::ExitUpdateMode { admin_user } => match ctx.mode_manager.exit_update_mode(&admin_user) {
            Ok(()) => {
                ctx.watcher.resume();
                logging::emit(EventType::UpdateModeDisabled, "*", &admin_user);
                Response::ok_empty()
            }
            Err(e) => Response::err(e.to_string()),
        },
        Command::ExitEmergencyMode { admin_user } => match ctx.mode_manager.exit_emergency_mode(&admin_user) {
            Ok(()) => {
                ctx.watcher.resume();
                logging::emit(EventType::AdminAction, "*", &format!("{admin_user} exited emergency mode"));
                Response::ok_empty()
            }
            Err(e) => Response::err(e.to_string()),
        },

        Command::AddPath { path } => add_path(ctx, path),
        Command::RemovePath { path } => remove_path(ctx, path),
        Command::GetPaths => {
            let config = ctx.config.lock().unwrap();
            Response::ok(json!({ "paths": config.protected_paths }))
        }

        Command::GetFiles => match ctx.store.list_paths() {
            Ok(paths) => Response::ok(json!({ "files": paths })),
            Err(e) => Response::err(e.to_string()),
        },
        Command::GetFileInfo { path } => get_file_info(ctx, &path),
        Command::CheckFile { path } => check_file(ctx, &path),
        Command::RestoreFile { path, admin_user } => restore_file(ctx, &path, &admin_user),

        Command::StartMonitoring => match ctx.watcher.start() {
            Ok(()) => Response::ok_empty(),
            Err(e) => Response::err(e.to_string()),
        },
        Command::StopMonitoring => {
            ctx.watcher.stop();
            Response::ok_empty()
        }
        Command::PauseMonitoring => {
            ctx.watcher.pause();
            Response::ok_empty()
        }
        Command::ResumeMonitoring => {
            ctx.watcher.resume();
            Response::ok_empty()
        }

        Command::InitializeBaseline => initialize_baseline(ctx),

        Command::GetConfig => Response::ok(&*ctx.config.lock().unwrap()),
        Command::UpdateConfig { config: _ } => {
            // Live config merge is not supported; changes to thresholds or
            // paths go through AddPath/RemovePath and take effect immediately,
            // everything else requires a restart.
            logging::emit(EventType::ConfigChanged, "*", "update_config acknowledged, restart to apply");
            Response::ok_empty()
        }

        Command::Shutdown => {
            logging::emit(EventType::AdminAction, "*", "shutdown requested via control channel");
            ctx.running.store(false, Ordering::SeqCst);
            Response::ok_empty()
        }
    }
}

fn get_status(ctx: &HandlerContext) -> Response {
    let mode_status = ctx.mode_manager.get_status();
    let store_stats = ctx.store.statistics().ok();
    let watcher_stats = ctx.watcher.statistics();
    Response::ok(json!({
        "running": ctx.running.load(Ordering::SeqCst),
        "mode": format!("{:?}", mode_status.current),
        "mode_status": mode_status,
        "storage": store_stats,
        "monitoring": watcher_stats,
        "stats": ctx.stats.snapshot(),
    }))
}

fn get_statistics(ctx: &HandlerContext) -> Response {
    Response::ok(json!({
        "system": ctx.stats.snapshot(),
        "storage": ctx.store.statistics().ok(),
        "monitoring": ctx.watcher.statistics(),
        "integrity": ctx.engine.get_modification_statistics(),
        "mode": ctx.mode_manager.get_status(),
    }))
}

fn add_path(ctx: &HandlerContext, path: String) -> Response {
    if !Path::new(&path).is_absolute() {
        return Response::err("path must be absolute");
    }
    let mut config = ctx.config.lock().unwrap();
    if let Err(e) = config::add_protected_path(&ctx.config_path, &mut config, path.clone()) {
        return Response::err(e.to_string());
    }
    drop(config);
    if let Err(e) = ctx.watcher.add_path(PathBuf::from(&path)) {
        return Response::err(e.to_string());
    }
    logging::emit(EventType::PathAdded, &path, "path added to protection");
    Response::ok_empty()
}

fn remove_path(ctx: &HandlerContext, path: String) -> Response {
    let mut config = ctx.config.lock().unwrap();
    if let Err(e) = config::remove_protected_path(&ctx.config_path, &mut config, &path) {
        return Response::err(e.to_string());
    }
    drop(config);
    if let Err(e) = ctx.watcher.remove_path(Path::new(&path)) {
        return Response::err(e.to_string());
    }
    logging::emit(EventType::PathRemoved, &path, "path removed from protection");
    Response::ok_empty()
}

fn get_file_info(ctx: &HandlerContext, path: &str) -> Response {
    if !ctx.mode_manager.validate_action(Action::GetFileInfo, None) {
        return Response::err("get_file_info not allowed in current mode");
    }
    let Ok(Some(record)) = ctx.store.get(path) else {
        return Response::err("file not found in baseline store");
    };
    let backup_info = ctx.recovery.get_backup_info(path);
    Response::ok(json!({
        "file_path": record.file_path,
        "file_size": record.file_size,
        "blocks_count": record.blocks_count,
        "is_trusted": record.is_trusted,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
        "backup_path": record.backup_path,
        "backup_info": backup_info,
    }))
}

fn check_file(ctx: &HandlerContext, path: &str) -> Response {
    if !ctx.mode_manager.validate_action(Action::VerifyFile, None) {
        return Response::err("check_file not allowed in current mode");
    }
    let Ok(Some(record)) = ctx.store.get(path) else {
        return Response::err("file not found in baseline store");
    };
    match ctx.engine.check_integrity(
        Path::new(path),
        &record.block_hashes,
        record.block_size,
        ctx.mode_manager.is_update_mode(),
    ) {
        Ok(result) => Response::ok(json!({
            "classification": format!("{:?}", result.classification),
            "change_percent": result.change_percent,
            "entropy": result.entropy,
            "changed_indices": result.changed_indices,
            "message": result.message,
        })),
        Err(e) => Response::err(e.to_string()),
    }
}

fn restore_file(ctx: &HandlerContext, path: &str, admin_user: &str) -> Response {
    if !ctx.mode_manager.validate_action(Action::RestoreFile, Some(admin_user)) {
        return Response::err("restore_file requires emergency-mode admin authorization");
    }
    let Ok(Some(record)) = ctx.store.get(path) else {
        return Response::err("file not found in baseline store");
    };
    let Some(backup) = record.backup_path.as_ref() else {
        return Response::err("no backup available for this file");
    };
    match ctx.recovery.restore_from_backup(Path::new(path), Path::new(backup)) {
        Ok(()) => {
            ctx.stats.record_file_restored();
            logging::emit(EventType::FileRestored, path, &format!("manually restored by {admin_user}"));
            Response::ok_empty()
        }
        Err(e) => Response::err(e.to_string()),
    }
}

fn initialize_baseline(ctx: &HandlerContext) -> Response {
    if !ctx.mode_manager.validate_action(Action::InitializeBaseline, None) {
        return Response::err("initialize_baseline requires init mode");
    }

    let orchestrator = ctx.orchestrator.clone();
    let config = ctx.config.clone();
    let control_channel = ctx.control_channel.clone();
    let rt_handle = ctx.rt_handle.clone();

    std::thread::spawn(move || {
        let block_size = config.lock().unwrap().block.size;
        let protected_paths: Vec<String> = config.lock().unwrap().protected_paths.clone();
        let mut total = 0usize;
        let Some(orch) = orchestrator.get() else { return };

        for base in protected_paths {
            let base_path = Path::new(&base);
            if base_path.is_file() {
                if orch.initialize_baseline(&base, block_size).is_ok() {
                    total += 1;
                }
                continue;
            }
            for entry in walkdir::WalkDir::new(base_path).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let file_path = entry.path().to_string_lossy().into_owned();
                if orch.initialize_baseline(&file_path, block_size).is_ok() {
                    total += 1;
                }
            }
        }

        logging::emit(EventType::AdminAction, "*", &format!("baseline initialization complete: {total} files"));
        if let Some(channel) = control_channel.get().cloned() {
            rt_handle.spawn(async move {
                channel.broadcast_notification("initialization_complete", json!({ "total_files": total })).await;
            });
        }
    });

    Response::ok(json!({ "message": "initialization started" }))
}
