//! Daemon entry point: parses the command line, brings the system up, and
//! runs until a termination signal or a control-channel shutdown request.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;

use guard_daemon::system::GuardDaemon;

/// Host-based file-system integrity monitor with active anti-ransomware response.
#[derive(Parser, Debug)]
#[command(author, version, about = "secure-fs-guard daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/secure_fs_guard/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let (daemon, _log_guard) = match GuardDaemon::initialize(args.config).await {
        Ok(initialized) => initialized,
        Err(e) => {
            eprintln!("secure-fs-guard failed to start: {e:#}");
            return std::process::ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = daemon.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "daemon loop exited with an error");
            }
        }
        _ = wait_for_termination() => {
            daemon.request_shutdown();
        }
    }

    daemon.shutdown();
    std::process::ExitCode::SUCCESS
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM — whichever comes first.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => tracing::info!("shutdown requested (ctrl-c)"),
            _ = sigterm.recv() => tracing::info!("shutdown requested (sigterm)"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        tracing::info!("shutdown requested (ctrl-c)");
    }
}
