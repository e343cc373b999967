//! Worker-thread side: a fresh Boa context per execution.
//!
//! The module is parsed and evaluated, the requested action is looked
//! up on the module namespace and called with the arguments document.
//! Two host functions exist: `__caprun_call`, wrapped by the `mcp`
//! proxy prelude, and `__caprun_branch`, wrapped by `caprun.branch`.
//! Bridge errors are tagged with their error kind (`[rpc-timeout] …`)
//! so a structured kind survives the trip through a JS exception; an
//! exception the code throws itself carries no tag and surfaces as
//! `code-error`.

use std::cell::RefCell;
use std::time::Duration;

use boa_engine::builtins::promise::PromiseState;
use boa_engine::module::Module;
use boa_engine::object::builtins::JsPromise;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use serde_json::Value;

use caprun_domain::error::{Error, ErrorKind, Result};

use crate::bridge::{RpcRequest, WorkerMessage};

/// In-engine backstop against runaway loops. The host wall-clock
/// timeout is the real limit; this stops a tight loop from pinning a
/// core long after the host has given up.
const LOOP_ITERATION_LIMIT: u64 = 50_000_000;

/// Builds the host surface: `globalThis.mcp` (property access yields
/// namespaces, then actions, each action a function forwarding to the
/// bridge) and `globalThis.caprun.branch` for branch reports.
const MCP_PRELUDE: &str = r#"
globalThis.mcp = new Proxy({}, {
    get(_target, namespace) {
        if (typeof namespace !== "string") return undefined;
        return new Proxy({}, {
            get(_inner, action) {
                if (typeof action !== "string") return undefined;
                return (args) => __caprun_call(
                    namespace + ":" + action,
                    args === undefined ? {} : args
                );
            }
        });
    }
});
globalThis.caprun = {
    branch(nodeId, outcome, condition) {
        __caprun_branch(
            String(nodeId),
            String(outcome),
            condition === undefined || condition === null ? null : String(condition)
        );
    }
};
"#;

/// Everything the worker thread needs for one execution.
pub(crate) struct ExecutionJob {
    pub code: String,
    pub action: String,
    pub args: Value,
    pub host_tx: tokio::sync::mpsc::UnboundedSender<WorkerMessage>,
    pub rpc_timeout: Duration,
}

struct WorkerBridge {
    host_tx: tokio::sync::mpsc::UnboundedSender<WorkerMessage>,
    rpc_timeout: Duration,
    next_correlation: u64,
}

impl WorkerBridge {
    fn call(&mut self, identifier: String, args: Value) -> Result<Value> {
        let correlation_id = self.next_correlation;
        self.next_correlation += 1;

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.host_tx
            .send(WorkerMessage::ToolCall(RpcRequest {
                correlation_id,
                identifier: identifier.clone(),
                args,
                reply: reply_tx,
            }))
            .map_err(|_| {
                Error::new(ErrorKind::ExecutionTimeout, "host side detached from sandbox")
                    .with("identifier", identifier.clone())
            })?;

        match reply_rx.recv_timeout(self.rpc_timeout) {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::new(
                ErrorKind::RpcTimeout,
                format!(
                    "no reply to {identifier} within {}s",
                    self.rpc_timeout.as_secs()
                ),
            )
            .with("identifier", identifier)
            .with("correlation_id", correlation_id)),
        }
    }

    /// Fire-and-forget branch report. A detached host just drops it.
    fn branch(&self, node_id: String, outcome: String, condition: Option<String>) {
        let _ = self.host_tx.send(WorkerMessage::Branch {
            node_id,
            outcome,
            condition,
        });
    }
}

thread_local! {
    static BRIDGE: RefCell<Option<WorkerBridge>> = const { RefCell::new(None) };
}

/// The `__caprun_call(identifier, args)` host function.
fn bridge_call(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let identifier = args
        .first()
        .cloned()
        .unwrap_or_default()
        .to_string(context)?
        .to_std_string_escaped();
    let params = match args.get(1) {
        Some(value) if !value.is_undefined() && !value.is_null() => value.to_json(context)?,
        _ => Value::Object(serde_json::Map::new()),
    };

    let outcome = BRIDGE.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(bridge) => bridge.call(identifier, params),
            None => Err(Error::new(
                ErrorKind::CodeError,
                "mcp bridge is not available in this context",
            )),
        }
    });

    match outcome {
        Ok(value) => JsValue::from_json(&value, context),
        // Kind tag survives the trip through the JS exception.
        Err(err) => Err(JsNativeError::error()
            .with_message(format!("[{}] {}", err.kind.as_str(), err.message))
            .into()),
    }
}

/// The `__caprun_branch(nodeId, outcome, condition)` host function.
fn bridge_branch(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let node_id = args
        .first()
        .cloned()
        .unwrap_or_default()
        .to_string(context)?
        .to_std_string_escaped();
    let outcome = args
        .get(1)
        .cloned()
        .unwrap_or_default()
        .to_string(context)?
        .to_std_string_escaped();
    let condition = match args.get(2) {
        Some(value) if !value.is_null() && !value.is_undefined() => {
            Some(value.to_string(context)?.to_std_string_escaped())
        }
        _ => None,
    };

    BRIDGE.with(|cell| {
        if let Some(bridge) = cell.borrow().as_ref() {
            bridge.branch(node_id, outcome, condition);
        }
    });
    Ok(JsValue::undefined())
}

/// Run one execution to completion on the current thread.
pub(crate) fn run_execution(job: ExecutionJob) -> Result<Value> {
    BRIDGE.with(|cell| {
        *cell.borrow_mut() = Some(WorkerBridge {
            host_tx: job.host_tx.clone(),
            rpc_timeout: job.rpc_timeout,
            next_correlation: 1,
        });
    });
    let result = run_in_context(&job);
    BRIDGE.with(|cell| {
        *cell.borrow_mut() = None;
    });
    result
}

fn run_in_context(job: &ExecutionJob) -> Result<Value> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

    context
        .register_global_callable(
            js_string!("__caprun_call"),
            2,
            NativeFunction::from_fn_ptr(bridge_call),
        )
        .map_err(|err| internal_error("registering bridge function", err, &mut context))?;
    context
        .register_global_callable(
            js_string!("__caprun_branch"),
            3,
            NativeFunction::from_fn_ptr(bridge_branch),
        )
        .map_err(|err| internal_error("registering branch function", err, &mut context))?;

    context
        .eval(Source::from_bytes(MCP_PRELUDE))
        .map_err(|err| internal_error("installing mcp proxy", err, &mut context))?;

    // ── Module evaluation ────────────────────────────────────────────
    let module = Module::parse(Source::from_bytes(job.code.as_bytes()), None, &mut context)
        .map_err(|err| {
            Error::new(
                ErrorKind::ModuleImportFailed,
                format!("capability code failed to parse: {}", js_message(err, &mut context)),
            )
        })?;

    let evaluation = module.load_link_evaluate(&mut context);
    context.run_jobs();
    match evaluation.state() {
        PromiseState::Fulfilled(_) => {}
        PromiseState::Rejected(reason) => {
            return Err(Error::new(
                ErrorKind::ModuleImportFailed,
                format!(
                    "capability module evaluation failed: {}",
                    value_message(&reason, &mut context)
                ),
            ));
        }
        PromiseState::Pending => {
            return Err(Error::new(
                ErrorKind::ModuleImportFailed,
                "capability module evaluation did not settle",
            ));
        }
    }

    // ── Action dispatch ──────────────────────────────────────────────
    // The host picks the action by name; capabilities exporting a
    // single entry point conventionally name it `run`.
    let namespace = module.namespace(&mut context);
    let export = namespace
        .get(JsString::from(job.action.as_str()), &mut context)
        .map_err(|err| internal_error("reading module export", err, &mut context))?;
    let export = if export.as_callable().is_some() {
        export
    } else {
        namespace
            .get(js_string!("run"), &mut context)
            .map_err(|err| internal_error("reading module export", err, &mut context))?
    };
    let Some(function) = export.as_callable() else {
        return Err(Error::new(
            ErrorKind::MethodNotFound,
            format!("capability exports no action named {:?} (and no `run`)", job.action),
        )
        .with("action", job.action.as_str()));
    };

    let js_args = JsValue::from_json(&job.args, &mut context).map_err(|err| {
        Error::new(
            ErrorKind::CodeError,
            format!("arguments not representable: {}", js_message(err, &mut context)),
        )
    })?;

    let returned = function
        .call(&JsValue::undefined(), &[js_args], &mut context)
        .map_err(|err| code_error(err, &mut context))?;
    context.run_jobs();

    // Async actions return a promise; settle it.
    let promise = returned
        .as_object()
        .cloned()
        .and_then(|object| JsPromise::from_object(object).ok());
    let settled = match promise {
        Some(promise) => {
            context.run_jobs();
            match promise.state() {
                PromiseState::Fulfilled(value) => value,
                PromiseState::Rejected(reason) => {
                    return Err(thrown_value_error(&reason, &mut context));
                }
                PromiseState::Pending => {
                    return Err(Error::new(
                        ErrorKind::CodeError,
                        "capability action returned a promise that never settled",
                    )
                    .with("action", job.action.as_str()));
                }
            }
        }
        None => returned,
    };

    if settled.is_undefined() || settled.is_null() {
        return Ok(Value::Null);
    }
    settled.to_json(&mut context).map_err(|err| {
        Error::new(
            ErrorKind::CodeError,
            format!(
                "capability returned a non-serializable value: {}",
                js_message(err, &mut context)
            ),
        )
    })
}

/// Map a thrown JsError to a structured error, recovering the bridge's
/// kind tag when one is present.
fn code_error(err: JsError, context: &mut Context) -> Error {
    let message = js_message(err, context);
    structured_from_message(message)
}

fn thrown_value_error(reason: &JsValue, context: &mut Context) -> Error {
    structured_from_message(value_message(reason, context))
}

fn structured_from_message(message: String) -> Error {
    for kind in [
        ErrorKind::RpcTimeout,
        ErrorKind::ExecutionTimeout,
        ErrorKind::SubprocessTimeout,
        ErrorKind::SubprocessCallFailed,
        ErrorKind::ToolDenied,
        ErrorKind::EnvMissing,
        ErrorKind::MetadataFetchFailed,
        ErrorKind::MetadataParseError,
        ErrorKind::WorkflowNotFound,
        ErrorKind::DependencyNotApproved,
    ] {
        if message.contains(&format!("[{}]", kind.as_str())) {
            return Error::new(kind, message);
        }
    }
    Error::new(ErrorKind::CodeError, message)
}

fn js_message(err: JsError, context: &mut Context) -> String {
    let value = err.to_opaque(context);
    value_message(&value, context)
}

fn value_message(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "uncaught error".to_string())
}

fn internal_error(stage: &str, err: JsError, context: &mut Context) -> Error {
    Error::new(
        ErrorKind::CodeError,
        format!("{stage} failed: {}", js_message(err, context)),
    )
}
