//! Host side of the sandbox: worker lifecycle, RPC servicing, timeouts,
//! and UI-resource collection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use caprun_domain::config::SandboxConfig;
use caprun_domain::error::{Error, ErrorKind, Result};

use crate::bridge::{ExecutionOutput, RpcRequest, ToolDispatcher, UiResource, WorkerMessage};
use crate::worker::{self, ExecutionJob};

/// Executes capability code on dedicated worker threads.
///
/// Each `execute` gets a fresh Boa context and thread; the executor
/// itself only carries configuration and the terminated flag.
pub struct SandboxExecutor {
    config: SandboxConfig,
    active: AtomicBool,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(true),
        }
    }

    /// Whether `execute` is still accepted.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Terminate the sandbox. Idempotent; subsequent `execute` calls
    /// fail with `worker-terminated`.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!("sandbox executor shut down");
        }
    }

    /// Run `action` from `code` with the arguments document, routing
    /// every `mcp.*` call through `dispatcher`.
    pub async fn execute(
        &self,
        code: &str,
        action: &str,
        args: Value,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<ExecutionOutput> {
        if !self.is_active() {
            return Err(Error::new(
                ErrorKind::WorkerTerminated,
                "sandbox executor has been shut down",
            )
            .with("action", action));
        }

        let execution_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        let (host_tx, mut host_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerMessage>();
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<Result<Value>>();

        let job = ExecutionJob {
            code: code.to_string(),
            action: action.to_string(),
            args,
            host_tx,
            rpc_timeout: Duration::from_secs(self.config.rpc_timeout_sec),
        };

        std::thread::Builder::new()
            .name(format!("caprun-sandbox-{}", &execution_id[..8]))
            .spawn(move || {
                let result = worker::run_execution(job);
                let _ = done_tx.send(result);
            })
            .map_err(|error| {
                Error::new(
                    ErrorKind::CodeError,
                    format!("failed to start sandbox worker: {error}"),
                )
            })?;

        let mut ui_resources: Vec<UiResource> = Vec::new();
        let mut channel_open = true;
        let deadline = tokio::time::sleep(Duration::from_secs(self.config.execution_timeout_sec));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    // Dropping the message receiver detaches the worker:
                    // its next bridge call errors and the thread unwinds.
                    tracing::warn!(action, execution_id = %execution_id, "sandbox execution timed out");
                    return Err(Error::new(
                        ErrorKind::ExecutionTimeout,
                        format!(
                            "execution exceeded {}s",
                            self.config.execution_timeout_sec
                        ),
                    )
                    .with("action", action));
                }
                finished = &mut done_rx => {
                    // The worker may have queued reports right before
                    // finishing; drain them so none are dropped.
                    while let Ok(message) = host_rx.try_recv() {
                        match message {
                            WorkerMessage::ToolCall(request) => {
                                service_rpc(request, &dispatcher, &execution_id, &mut ui_resources).await;
                            }
                            WorkerMessage::Branch { node_id, outcome, condition } => {
                                dispatcher.record_branch(&node_id, &outcome, condition);
                            }
                        }
                    }
                    let result = finished.map_err(|_| {
                        Error::new(ErrorKind::CodeError, "sandbox worker disappeared")
                            .with("action", action)
                    })?;
                    let value = result?;
                    return Ok(ExecutionOutput {
                        value,
                        duration_ms: started.elapsed().as_millis() as u64,
                        ui_resources,
                    });
                }
                message = host_rx.recv(), if channel_open => {
                    match message {
                        Some(WorkerMessage::ToolCall(request)) => {
                            service_rpc(request, &dispatcher, &execution_id, &mut ui_resources).await;
                        }
                        Some(WorkerMessage::Branch { node_id, outcome, condition }) => {
                            dispatcher.record_branch(&node_id, &outcome, condition);
                        }
                        None => channel_open = false,
                    }
                }
            }
        }
    }
}

async fn service_rpc(
    request: RpcRequest,
    dispatcher: &Arc<dyn ToolDispatcher>,
    execution_id: &str,
    ui_resources: &mut Vec<UiResource>,
) {
    tracing::debug!(
        correlation_id = request.correlation_id,
        tool = %request.identifier,
        "sandbox rpc"
    );
    let result = dispatcher
        .call_tool(&request.identifier, request.args.clone(), execution_id)
        .await;
    if let Ok(value) = &result {
        collect_ui(ui_resources, &request.identifier, &request.args, value);
    }
    // The worker may have hit its RPC deadline and moved on.
    let _ = request.reply.send(result);
}

/// Record a `{_meta: {ui: {resourceUri, context?}}}` response shape.
fn collect_ui(ui_resources: &mut Vec<UiResource>, identifier: &str, args: &Value, result: &Value) {
    let Some(meta_ui) = result.get("_meta").and_then(|meta| meta.get("ui")) else {
        return;
    };
    let Some(resource_uri) = meta_ui.get("resourceUri").and_then(Value::as_str) else {
        return;
    };
    let mut context = meta_ui
        .get("context")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(map) = &mut context {
        map.insert("_args".into(), args.clone());
    }
    let slot = ui_resources.len() as u64;
    ui_resources.push(UiResource {
        source: identifier.to_string(),
        resource_uri: resource_uri.to_string(),
        slot,
        context,
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
