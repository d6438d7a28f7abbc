//! The local control channel: a length-prefixed JSON request/response
//! protocol over a Unix domain socket, used by a management UI to invoke
//! core operations and receive broadcast notifications.
//!
//! Commands are a closed sum type dispatched through a single `match` in
//! the caller-supplied handler, replacing a string-keyed dispatch table —
//! an unrecognized command string is a parse error here, not a silently
//! accepted dictionary key.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One variant per command the original dispatch dictionary registered a
/// handler for.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    GetStatus,
    GetStatistics,
    GetLogs { limit: Option<usize> },
    EnterInitMode { admin_user: String },
    ExitInitMode { admin_user: String },
    EnterUpdateMode { admin_user: String, timeout_seconds: u64 },
    ExitUpdateMode { admin_user: String },
    ExitEmergencyMode { admin_user: String },
    AddPath { path: String },
    RemovePath { path: String },
    GetPaths,
    GetFiles,
    GetFileInfo { path: String },
    CheckFile { path: String },
    RestoreFile { path: String, admin_user: String },
    StartMonitoring,
    StopMonitoring,
    PauseMonitoring,
    ResumeMonitoring,
    InitializeBaseline,
    GetConfig,
    UpdateConfig { config: Value },
    Shutdown,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub type CommandHandler = dyn Fn(Command) -> Response + Send + Sync + 'static;

pub struct ControlChannel {
    socket_path: PathBuf,
    handler: Arc<CommandHandler>,
    connections: Arc<Mutex<Vec<Arc<Mutex<UnixStream>>>>>,
}

impl ControlChannel {
    pub fn new(socket_path: impl Into<PathBuf>, handler: impl Fn(Command) -> Response + Send + Sync + 'static) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler: Arc::new(handler),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Binds the socket (removing a stale one if present) and serves
    /// connections until the returned future is dropped or cancelled.
    pub async fn serve(&self) -> Result<(), ControlChannelError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        set_socket_mode(&self.socket_path)?;

        loop {
            let (stream, _addr) = listener.accept().await?;
            let handler = self.handler.clone();
            let connections = self.connections.clone();
            let shared = Arc::new(Mutex::new(stream));
            connections.lock().await.push(shared.clone());
            tokio::spawn(async move {
                handle_connection(shared.clone(), handler).await;
                connections.lock().await.retain(|c| !Arc::ptr_eq(c, &shared));
            });
        }
    }

    /// Sends a notification frame to every currently-connected client.
    pub async fn broadcast_notification(&self, notification_type: &str, data: impl Serialize) {
        let payload = serde_json::json!({
            "type": "notification",
            "notification_type": notification_type,
            "data": serde_json::to_value(data).ok(),
        });
        let response = Response::ok(payload);
        let connections = self.connections.lock().await.clone();
        for conn in connections {
            let mut stream = conn.lock().await;
            if write_response(&mut stream, &response).await.is_err() {
                tracing::debug!("dropping dead control-channel connection during broadcast");
            }
        }
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

async fn handle_connection(stream: Arc<Mutex<UnixStream>>, handler: Arc<CommandHandler>) {
    loop {
        let raw = {
            let mut stream = stream.lock().await;
            read_frame(&mut *stream).await
        };
        let message = match raw {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "control channel connection closed");
                break;
            }
        };

        let response = match serde_json::from_slice::<Value>(&message) {
            Ok(value) => dispatch(value, &handler),
            Err(_) => Response::err("invalid JSON"),
        };

        let mut stream = stream.lock().await;
        if write_response(&mut *stream, &response).await.is_err() {
            break;
        }
    }
}

fn dispatch(value: Value, handler: &Arc<CommandHandler>) -> Response {
    let Some(command_name) = value.get("command").and_then(Value::as_str) else {
        return Response::err("missing field 'command'");
    };
    let params = value.get("params").cloned().unwrap_or(Value::Object(Default::default()));
    let tagged = serde_json::json!({ "command": command_name, "params": params });

    match serde_json::from_value::<Command>(tagged) {
        Ok(command) => (handler)(command),
        Err(_) => Response::err(format!("unknown or malformed command: {command_name}")),
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let length = u32::from_be_bytes(len_buf);
    if length > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES}-byte cap"),
        ));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let body = serde_json::to_vec(response).unwrap_or_else(|_| b"{}".to_vec());
    let length = (body.len() as u32).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(&body).await?;
    Ok(())
}

#[cfg(unix)]
fn set_socket_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_tagged_json() {
        let command = Command::EnterUpdateMode {
            admin_user: "root".to_string(),
            timeout_seconds: 120,
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "enter_update_mode");
        assert_eq!(json["params"]["timeout_seconds"], 120);

        let round_tripped: Command = serde_json::from_value(json).unwrap();
        matches!(round_tripped, Command::EnterUpdateMode { .. });
    }

    #[test]
    fn dispatch_rejects_unknown_command_name() {
        let handler: Arc<CommandHandler> = Arc::new(|_| Response::ok_empty());
        let value = serde_json::json!({ "command": "not_a_real_command", "params": {} });
        let response = dispatch(value, &handler);
        assert!(!response.success);
    }

    #[test]
    fn dispatch_requires_command_field() {
        let handler: Arc<CommandHandler> = Arc::new(|_| Response::ok_empty());
        let value = serde_json::json!({ "params": {} });
        let response = dispatch(value, &handler);
        assert!(!response.success);
        assert!(response.error.unwrap().contains("command"));
    }

    #[test]
    fn dispatch_routes_ping_to_handler() {
        let handler: Arc<CommandHandler> = Arc::new(|cmd| match cmd {
            Command::Ping => Response::ok("pong"),
            _ => Response::err("unexpected"),
        });
        let value = serde_json::json!({ "command": "ping", "params": {} });
        let response = dispatch(value, &handler);
        assert!(response.success);
        assert_eq!(response.data.unwrap(), "pong");
    }
}
