//! Stdio transport: NDJSON JSON-RPC with request-id multiplexing.
//!
//! One child process per transport. A single writer owns the stdin
//! side; a reader task owns stdout, accumulates bytes in a residual
//! buffer, peels off complete newline-terminated JSON objects, and
//! demultiplexes responses to the pending-request table by id. Requests
//! unanswered within the per-request deadline reject with
//! `subprocess-timeout`; a dying reader rejects everything still
//! pending and marks the handle dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use caprun_domain::capability::SubprocessDep;
use caprun_domain::error::{Error, ErrorKind, Result};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Trait for MCP server transports.
///
/// Boxed behind the manager so tests and future transports (e.g. an
/// HTTP bridge) can stand in for a real child process.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the matching response.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the transport can still carry requests.
    fn is_alive(&self) -> bool;

    /// Number of requests currently awaiting a response.
    fn pending_count(&self) -> usize;

    /// Shut down: reject pending requests, close stdin, terminate.
    async fn shutdown(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending-request table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingRequest {
    method: String,
    #[allow(dead_code)]
    sent_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

type PendingMap = Arc<SyncMutex<HashMap<u64, PendingRequest>>>;

/// Remove every pending request and reject it with a terminal error.
fn reject_all(pending: &PendingMap, name: &str, reason: &str) {
    let drained: Vec<(u64, PendingRequest)> = pending.lock().drain().collect();
    for (id, request) in drained {
        let err = Error::new(ErrorKind::SubprocessCallFailed, reason.to_string())
            .with("dependency", name)
            .with("method", request.method)
            .with("request_id", id);
        let _ = request.tx.send(Err(err));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Peel complete newline-terminated frames off the residual buffer.
/// A half-received object stays buffered for the next read tick.
fn take_frames(residual: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Some(pos) = residual.iter().position(|&b| b == b'\n') {
        let frame: Vec<u8> = residual.drain(..=pos).collect();
        frames.push(frame);
    }
    frames
}

/// Handle one frame: resolve the matching pending request, or skip
/// everything that is not a response (notifications, server-initiated
/// requests, log lines leaking onto stdout).
fn dispatch_frame(pending: &PendingMap, frame: &[u8], name: &str) {
    let Ok(text) = std::str::from_utf8(frame) else {
        tracing::debug!(server = %name, "skipping non-UTF-8 frame from subprocess stdout");
        return;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    if !trimmed.starts_with('{') {
        tracing::debug!(server = %name, line = %trimmed, "skipping non-JSON line from subprocess stdout");
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        tracing::debug!(server = %name, line = %trimmed, "skipping unparseable frame");
        return;
    };

    // A response has an id and a result or error, and no method. Echoed
    // requests and notifications must not satisfy a pending entry.
    let is_response = value.get("id").is_some()
        && value.get("method").is_none()
        && (value.get("result").is_some() || value.get("error").is_some());
    if !is_response {
        tracing::debug!(server = %name, "ignoring non-response message from subprocess");
        return;
    }

    let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) else {
        tracing::debug!(server = %name, line = %trimmed, "skipping malformed response");
        return;
    };

    let entry = pending.lock().remove(&response.id);
    match entry {
        Some(request) => {
            let method = request.method.clone();
            let id = response.id;
            let outcome = response.into_result().map_err(|rpc_err| {
                Error::new(ErrorKind::SubprocessCallFailed, rpc_err.message)
                    .with("code", rpc_err.code)
                    .with("dependency", name)
                    .with("method", method)
            });
            tracing::debug!(server = %name, id, ok = outcome.is_ok(), "response delivered");
            let _ = request.tx.send(outcome);
        }
        None => {
            tracing::debug!(server = %name, id = response.id, "response for unknown request id");
        }
    }
}

async fn read_loop(mut stdout: ChildStdout, pending: PendingMap, alive: Arc<AtomicBool>, name: String) {
    let mut residual: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            // EOF — both pipes closing is how a crash surfaces.
            Ok(0) => break,
            Ok(n) => {
                residual.extend_from_slice(&chunk[..n]);
                for frame in take_frames(&mut residual) {
                    dispatch_frame(&pending, &frame, &name);
                }
            }
            Err(error) => {
                tracing::warn!(server = %name, error = %error, "subprocess stdout read failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    reject_all(&pending, &name, "subprocess closed its stdout");
    tracing::debug!(server = %name, "reader task finished");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StdioTransport {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the dependency's server process and start the read loops.
    ///
    /// The launch command is the explicit `command`+`args` pair when the
    /// dependency provides one, otherwise the shell-tokenized `install`
    /// string.
    pub fn spawn(dep: &SubprocessDep, request_timeout: Duration) -> Result<Self> {
        let (program, args) = launch_command(dep)?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|error| {
            Error::new(
                ErrorKind::SubprocessSpawnFailed,
                format!("failed to spawn {program:?}: {error}"),
            )
            .with("dependency", dep.name.as_str())
            .with("command", program.as_str())
        })?;

        let stdin = child.stdin.take().ok_or_else(|| pipe_error(&dep.name, "stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error(&dep.name, "stdout"))?;

        // Drain stderr fire-and-forget; drain errors are discarded.
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            alive.clone(),
            dep.name.clone(),
        ));

        tracing::info!(dep = %dep.name, program = %program, "subprocess spawned");

        Ok(Self {
            name: dep.name.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            request_timeout,
        })
    }

    async fn write_line(&self, json: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::SubprocessCallFailed, "subprocess stdin is closed")
                .with("dependency", self.name.as_str())
        })?;
        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|error| {
            Error::new(
                ErrorKind::SubprocessCallFailed,
                format!("stdin write failed: {error}"),
            )
            .with("dependency", self.name.as_str())
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_alive() {
            return Err(
                Error::new(ErrorKind::SubprocessCallFailed, "subprocess is not running")
                    .with("dependency", self.name.as_str())
                    .with("method", method),
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request).map_err(|error| {
            Error::new(
                ErrorKind::SubprocessCallFailed,
                format!("request serialization failed: {error}"),
            )
            .with("dependency", self.name.as_str())
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );

        tracing::debug!(dep = %self.name, id, method, "sending subprocess request");
        if let Err(error) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(error);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender side was dropped: handle torn down mid-flight.
            Ok(Err(_)) => Err(Error::new(
                ErrorKind::SubprocessCallFailed,
                "subprocess handle shut down while request was in flight",
            )
            .with("dependency", self.name.as_str())
            .with("method", method)),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::new(
                    ErrorKind::SubprocessTimeout,
                    format!(
                        "no response to {method} within {}s",
                        self.request_timeout.as_secs()
                    ),
                )
                .with("dependency", self.name.as_str())
                .with("method", method)
                .with("request_id", id))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif).map_err(|error| {
            Error::new(
                ErrorKind::SubprocessCallFailed,
                format!("notification serialization failed: {error}"),
            )
            .with("dependency", self.name.as_str())
        })?;
        tracing::debug!(dep = %self.name, method, "sending subprocess notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        reject_all(&self.pending, &self.name, "subprocess shut down");

        // Close stdin to signal the process to exit.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(error) = stdin.shutdown().await {
                tracing::debug!(dep = %self.name, error = %error, "error closing subprocess stdin");
            }
        }

        // Give the process a moment to exit, then terminate it.
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(dep = %self.name, ?status, "subprocess exited");
                }
                Ok(Err(error)) => {
                    tracing::debug!(dep = %self.name, error = %error, "error waiting for subprocess");
                }
                Err(_) => {
                    tracing::debug!(dep = %self.name, "subprocess did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

fn launch_command(dep: &SubprocessDep) -> Result<(String, Vec<String>)> {
    if let Some(command) = &dep.command {
        return Ok((command.clone(), dep.args.clone().unwrap_or_default()));
    }
    let tokens = shell_words::split(&dep.install).map_err(|error| {
        Error::new(
            ErrorKind::SubprocessSpawnFailed,
            format!("unparseable launch command: {error}"),
        )
        .with("dependency", dep.name.as_str())
        .with("command", dep.install.as_str())
    })?;
    let mut iter = tokens.into_iter();
    let program = iter.next().ok_or_else(|| {
        Error::new(ErrorKind::SubprocessSpawnFailed, "empty launch command")
            .with("dependency", dep.name.as_str())
    })?;
    Ok((program, iter.collect()))
}

fn pipe_error(name: &str, pipe: &str) -> Error {
    Error::new(
        ErrorKind::SubprocessSpawnFailed,
        format!("failed to capture subprocess {pipe}"),
    )
    .with("dependency", name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
