//! The local IPC surface.
//!
//! A Unix domain socket accepting newline-delimited JSON commands, one
//! connection per client thread. Stale sockets are cleaned up on bind and
//! the socket file is removed on drop only if it is still the one we
//! created (inode-checked), so a replacement daemon is never disturbed.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use sbclink_link::{LinkHandle, Outcome};
use sbclink_packet::{parse, CodeChannel, Request};

use crate::exit::DaemonError;
use crate::model::ObjectModelMirror;

const SOCKET_MODE: u32 = 0o600;

/// A command from a local client.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Run a code and return its reply text.
    Code { channel: CodeChannel, code: String },
    /// Wait until everything queued on the channel has completed.
    Flush {
        channel: CodeChannel,
        #[serde(default)]
        sync_file_streams: bool,
    },
    /// Acquire the firmware movement lock.
    Lock { channel: CodeChannel },
    /// Release held locks.
    Unlock { channel: CodeChannel },
    /// Acknowledge a blocking message prompt.
    Acknowledge { channel: CodeChannel },
    /// Read from the object-model mirror.
    GetObjectModel {
        #[serde(default)]
        key: String,
    },
    /// Write one object-model field on the firmware.
    SetObjectModelValue {
        field: String,
        value: serde_json::Value,
    },
    /// Queue an expression for evaluation in the firmware.
    Evaluate {
        channel: CodeChannel,
        expression: String,
    },
    /// Link and channel statistics.
    Diagnostics,
}

#[derive(Debug)]
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl IpcServer {
    /// Bind the socket, replacing a stale one if present.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                DaemonError::config(format!("cannot create {}: {err}", parent.display()))
            })?;
        }

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|err| {
                DaemonError::config(format!("cannot stat {}: {err}", path.display()))
            })?;
            if metadata.file_type().is_socket() {
                debug!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(&path).map_err(|err| {
                    DaemonError::config(format!("cannot remove {}: {err}", path.display()))
                })?;
            } else {
                return Err(DaemonError::config(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
        }

        let listener = UnixListener::bind(&path)
            .map_err(|err| DaemonError::config(format!("cannot bind {}: {err}", path.display())))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(
            |err| DaemonError::config(format!("cannot chmod {}: {err}", path.display())),
        )?;
        let created = std::fs::symlink_metadata(&path)
            .map(|m| (m.dev(), m.ino()))
            .ok();

        info!(path = %path.display(), "ipc socket listening");
        Ok(Self {
            listener,
            path,
            created_inode: created,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve clients until `shutdown` is set. Each connection
    /// gets its own thread; waiters block there, never in the Processor.
    pub fn serve(
        &self,
        handle: LinkHandle,
        model: Arc<ObjectModelMirror>,
        reply_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        if let Err(err) = self.listener.set_nonblocking(true) {
            warn!(%err, "cannot set ipc listener nonblocking");
            return;
        }

        while !shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let handle = handle.clone();
                    let model = Arc::clone(&model);
                    let result = std::thread::Builder::new()
                        .name("ipc-client".into())
                        .spawn(move || serve_client(stream, handle, model, reply_timeout));
                    if let Err(err) = result {
                        warn!(%err, "cannot spawn ipc client thread");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    warn!(%err, "ipc accept failed");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Some((dev, ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == dev
                    && metadata.ino() == ino
                {
                    let _ = std::fs::remove_file(&self.path);
                }
            }
        }
    }
}

fn serve_client(
    stream: UnixStream,
    handle: LinkHandle,
    model: Arc<ObjectModelMirror>,
    reply_timeout: Duration,
) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<IpcCommand>(&line) {
            Ok(command) => dispatch(command, &handle, &model, reply_timeout),
            Err(err) => json!({ "error": format!("bad command: {err}") }),
        };

        let mut encoded = reply.to_string();
        encoded.push('\n');
        if writer.write_all(encoded.as_bytes()).is_err() {
            break;
        }
    }
    debug!("ipc client disconnected");
}

fn dispatch(
    command: IpcCommand,
    handle: &LinkHandle,
    model: &ObjectModelMirror,
    reply_timeout: Duration,
) -> serde_json::Value {
    match command {
        IpcCommand::Code { channel, code } => {
            let code = match parse(&code, channel) {
                Ok(code) => code,
                Err(err) => return json!({ "error": err.to_string() }),
            };
            let waiter = handle.push_code(code);
            match waiter.wait_timeout(reply_timeout) {
                Some(Outcome::Completed(result)) => json!({
                    "result": result.reply,
                    "success": result.success,
                }),
                Some(Outcome::Aborted) => json!({ "error": "code aborted" }),
                Some(Outcome::Cancelled) => json!({ "error": "code cancelled" }),
                None => {
                    // Detach: the code keeps running on the firmware.
                    json!({ "error": "timed out waiting for the reply" })
                }
            }
        }
        IpcCommand::Flush {
            channel,
            sync_file_streams,
        } => {
            let waiter = handle.flush(channel, sync_file_streams);
            match waiter.wait_timeout(reply_timeout) {
                Some(Outcome::Completed(done)) => json!({ "result": done }),
                Some(_) => json!({ "result": false }),
                None => json!({ "error": "timed out waiting for the flush" }),
            }
        }
        IpcCommand::Lock { channel } => {
            match handle.lock(channel).wait_timeout(reply_timeout) {
                Some(Outcome::Completed(())) => json!({ "result": true }),
                Some(_) => json!({ "error": "lock aborted" }),
                None => json!({ "error": "timed out acquiring the lock" }),
            }
        }
        IpcCommand::Unlock { channel } => {
            match handle.unlock(channel).wait_timeout(reply_timeout) {
                Some(Outcome::Completed(())) => json!({ "result": true }),
                Some(_) => json!({ "error": "unlock aborted" }),
                None => json!({ "error": "timed out releasing the lock" }),
            }
        }
        IpcCommand::Acknowledge { channel } => {
            handle.acknowledge(channel);
            json!({ "result": true })
        }
        IpcCommand::GetObjectModel { key } => json!({ "result": model.query(&key) }),
        IpcCommand::SetObjectModelValue { field, value } => {
            handle.send_request(Request::SetObjectModelValue {
                field,
                value: value.to_string(),
            });
            json!({ "result": true })
        }
        IpcCommand::Evaluate {
            channel,
            expression,
        } => {
            handle.send_request(Request::EvaluateExpression {
                channel: channel as u8,
                expression,
            });
            json!({ "result": "queued" })
        }
        IpcCommand::Diagnostics => match serde_json::to_value(handle.diagnostics()) {
            Ok(value) => json!({ "result": value }),
            Err(err) => json!({ "error": err.to_string() }),
        },
    }
}
