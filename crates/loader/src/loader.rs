//! Capability loading and invocation.
//!
//! `call` drives the whole ladder: loaded cache → permission →
//! metadata → dependencies (install consent, credentials) → code fetch
//! → integrity → sandbox execution. Any step needing human consent
//! suspends the invocation into the workflow store and returns an
//! approval envelope; a continuation token resumes it. Nested calls the
//! sandboxed code makes re-enter here through [`Dispatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use caprun_domain::capability::{CapabilityMetadata, RoutingPreference, SubprocessDep};
use caprun_domain::config::Route;
use caprun_domain::envelope::{ApprovalEnvelope, ApprovalKind, CallOutcome, ContinueWorkflow};
use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::events::RuntimeEvent;
use caprun_domain::identifier::{Fqcn, ToolId};
use caprun_policy::{check_env_vars, CapabilityDecision, PermissionDecision};
use caprun_sandbox::ToolDispatcher;
use caprun_state::{sha256_token, IntegrityToken, LockKind, LockfileVerdict};
use caprun_trace::TraceCollector;
use caprun_workflow::PendingWorkflow;

use crate::code::fetch_code;
use crate::remote::remote_call;
use crate::runtime::Runtime;

/// A capability with its code in hand, ready to execute.
pub(crate) struct LoadedCapability {
    pub(crate) metadata: Arc<CapabilityMetadata>,
    pub(crate) code: String,
}

impl LoadedCapability {
    /// The published tool identifier matching an action name.
    fn tool_for_action(&self, action: &str) -> Option<ToolId> {
        self.metadata
            .tools
            .iter()
            .filter_map(|raw| ToolId::parse(raw))
            .find(|tool| tool.action == action)
    }
}

/// Handle returned by [`Runtime::load`]; still exposes `call`.
pub struct Loaded {
    runtime: Runtime,
    capability: Arc<LoadedCapability>,
}

impl Loaded {
    pub fn metadata(&self) -> &CapabilityMetadata {
        &self.capability.metadata
    }

    /// Invoke one of the capability's actions.
    pub async fn call(&self, action: &str, args: Value) -> Result<Value> {
        self.runtime
            .dispatch_loaded(&self.capability, action, args)
            .await
    }
}

/// Result of a `load`: ready to call, or suspended on consent.
pub enum LoadOutcome {
    Ready(Loaded),
    ApprovalRequired(ApprovalEnvelope),
}

enum Load {
    Ready(Arc<LoadedCapability>),
    Suspended(ApprovalEnvelope),
}

type Resumed = (ContinueWorkflow, PendingWorkflow);

impl Runtime {
    /// Invoke a tool by identifier. The primary operation of the
    /// runtime: returns the capability's value, or an approval envelope
    /// the caller can resume with a continuation token.
    pub async fn call(
        &self,
        identifier: &str,
        args: Value,
        continuation: Option<ContinueWorkflow>,
    ) -> Result<CallOutcome> {
        let resumed = self.take_continuation(continuation)?;
        match self.load_inner(identifier, &args, resumed.as_ref()).await? {
            Load::Suspended(envelope) => Ok(CallOutcome::ApprovalRequired(envelope)),
            Load::Ready(capability) => {
                let action = ToolId::parse(identifier)
                    .map(|id| id.action)
                    .unwrap_or_else(|| "run".to_string());
                let value = self.dispatch_loaded(&capability, &action, args).await?;
                Ok(CallOutcome::Completed(value))
            }
        }
    }

    /// Load a capability without invoking it.
    pub async fn load(
        &self,
        identifier: &str,
        continuation: Option<ContinueWorkflow>,
    ) -> Result<LoadOutcome> {
        let resumed = self.take_continuation(continuation)?;
        match self
            .load_inner(identifier, &Value::Null, resumed.as_ref())
            .await?
        {
            Load::Suspended(envelope) => Ok(LoadOutcome::ApprovalRequired(envelope)),
            Load::Ready(capability) => Ok(LoadOutcome::Ready(Loaded {
                runtime: self.clone(),
                capability,
            })),
        }
    }

    /// Consume a continuation token: the workflow must still be alive,
    /// and resumption (approved or aborted) deletes it either way.
    fn take_continuation(&self, continuation: Option<ContinueWorkflow>) -> Result<Option<Resumed>> {
        let Some(token) = continuation else {
            return Ok(None);
        };
        let record = self.inner.workflows.get(&token.workflow_id).ok_or_else(|| {
            Error::new(
                ErrorKind::WorkflowNotFound,
                format!("no pending workflow {}", token.workflow_id),
            )
            .with("workflow_id", token.workflow_id.to_string())
        })?;
        self.inner.workflows.delete(&token.workflow_id);
        RuntimeEvent::WorkflowResumed {
            workflow_id: token.workflow_id.to_string(),
            approved: token.approved,
        }
        .emit();
        Ok(Some((token, record)))
    }

    /// Record a suspension in the workflow store and build the envelope
    /// the caller resumes it with.
    fn suspend_workflow(
        &self,
        args: &Value,
        identifier: &str,
        kind: ApprovalKind,
        payload: Value,
        description: String,
    ) -> ApprovalEnvelope {
        let workflow_id =
            self.inner
                .workflows
                .create(args.clone(), identifier, kind, payload.clone());
        RuntimeEvent::WorkflowSuspended {
            workflow_id: workflow_id.to_string(),
            kind: format!("{kind:?}"),
            tool: identifier.to_string(),
        }
        .emit();
        ApprovalEnvelope::new(kind, workflow_id, description, payload)
    }

    async fn load_inner(
        &self,
        identifier: &str,
        args: &Value,
        resumed: Option<&Resumed>,
    ) -> Result<Load> {
        let key = Fqcn::from_identifier(identifier).as_str().to_string();
        {
            let loaded = self.inner.loaded.lock().await;
            if let Some(capability) = loaded.get(&key) {
                return Ok(Load::Ready(capability.clone()));
            }
        }

        // Denied identifiers short-circuit before any registry traffic.
        if let Some(tool) = ToolId::parse(identifier) {
            if self.inner.policy.check(&tool) == PermissionDecision::Denied {
                return Err(Error::new(
                    ErrorKind::ToolDenied,
                    format!("tool {tool} is denied by policy"),
                )
                .with_tool(&tool));
            }
        }

        let fetched = self.inner.registry.fetch(identifier).await?;
        let metadata = Arc::new(fetched.metadata);
        RuntimeEvent::MetadataFetched {
            fqcn: metadata.fqdn.clone(),
            from_cache: fetched.from_cache,
        }
        .emit();

        // Capability-level decision over every exposed tool.
        let tools: Vec<ToolId> = metadata
            .tools
            .iter()
            .filter_map(|raw| ToolId::parse(raw))
            .collect();
        if self.inner.policy.check_capability(&tools) == CapabilityDecision::Blocked {
            return Err(Error::new(
                ErrorKind::ToolDenied,
                format!("capability {} exposes a denied tool", metadata.fqdn),
            )
            .with("fqcn", metadata.fqdn.as_str())
            .with("identifier", identifier));
        }

        // Dependencies, in declared order.
        for dep in &metadata.mcp_deps {
            if let Some(envelope) = self
                .ensure_dependency(identifier, args, dep, resumed)
                .await?
            {
                return Ok(Load::Suspended(envelope));
            }
        }

        // Code fetch and integrity.
        let code = fetch_code(&self.inner.http, &metadata.code_url).await?;

        if let Some(declared) = &metadata.integrity {
            let token = IntegrityToken::parse(declared)?;
            if !token.matches(code.as_bytes()) {
                return Err(Error::new(
                    ErrorKind::DependencyIntegrityFailed,
                    format!("fetched code does not match published integrity for {}", metadata.fqdn),
                )
                .with("fqcn", metadata.fqdn.as_str()));
            }
        }

        let fqcn = metadata.fqcn();
        let code_token = sha256_token(code.as_bytes());
        match self
            .inner
            .lockfile
            .validate(&fqcn, &code_token, LockKind::LocalCode)?
        {
            LockfileVerdict::Valid => {}
            LockfileVerdict::ApprovalRequired {
                fqcn_base,
                old_short,
                new_short,
            } => match resumed {
                Some((token, record)) if record.kind == ApprovalKind::Integrity => {
                    if !token.approved {
                        return Err(Error::new(
                            ErrorKind::DependencyNotApproved,
                            format!("integrity change for {fqcn_base} was rejected"),
                        )
                        .with("fqdnBase", fqcn_base)
                        .with("approval_type", "integrity"));
                    }
                    self.inner
                        .lockfile
                        .approve(&fqcn, &code_token, LockKind::LocalCode)?;
                }
                _ => {
                    let payload = json!({
                        "fqdnBase": fqcn_base,
                        "oldHash": old_short,
                        "newHash": new_short,
                    });
                    return Ok(Load::Suspended(self.suspend_workflow(
                        args,
                        identifier,
                        ApprovalKind::Integrity,
                        payload,
                        format!("code for {fqcn_base} changed ({old_short} -> {new_short})"),
                    )));
                }
            },
        }

        RuntimeEvent::CapabilityLoaded {
            fqcn: metadata.fqdn.clone(),
            tool_count: metadata.tools.len(),
            dep_count: metadata.mcp_deps.len(),
        }
        .emit();

        let capability = Arc::new(LoadedCapability { metadata, code });
        let mut loaded = self.inner.loaded.lock().await;
        let capability = loaded.entry(key).or_insert(capability).clone();
        Ok(Load::Ready(capability))
    }

    /// One rung of the dependency ladder. `None` means satisfied;
    /// `Some(envelope)` suspends the load.
    async fn ensure_dependency(
        &self,
        identifier: &str,
        args: &Value,
        dep: &SubprocessDep,
        resumed: Option<&Resumed>,
    ) -> Result<Option<ApprovalEnvelope>> {
        if self.inner.deps.is_installed(&dep.name, &dep.version) {
            return Ok(None);
        }

        // A continuation for this dependency either aborts the load or
        // arms the force-install flag for this dependency only.
        let applicable = resumed.filter(|(_, record)| {
            let dep_kinds = matches!(
                record.kind,
                ApprovalKind::Dependency | ApprovalKind::ToolPermission | ApprovalKind::ApiKeyRequired
            );
            dep_kinds
                && record
                    .payload
                    .get("dependency")
                    .and_then(|d| d.get("name"))
                    .and_then(Value::as_str)
                    == Some(dep.name.as_str())
        });
        if let Some((token, _)) = applicable {
            if !token.approved {
                return Err(Error::new(
                    ErrorKind::DependencyNotApproved,
                    format!("installation of {} was rejected", dep.name),
                )
                .with("dependency", dep.name.as_str())
                .with("identifier", identifier));
            }
        }
        let force_install = applicable.is_some_and(|(token, _)| token.approved);

        // `always` persists the grant: the namespace joins the allow
        // list, so future versions of this dependency skip the prompt.
        if force_install && applicable.is_some_and(|(token, _)| token.always == Some(true)) {
            self.inner.policy.grant_namespace(&dep.name);
        }

        // Credentials before anything touches the network.
        if !dep.env_required.is_empty() {
            let report = check_env_vars(&dep.env_required);
            if !report.is_satisfied() {
                let payload = json!({
                    "dependency": {"name": dep.name, "version": dep.version},
                    "missingKeys": report.problem_names(),
                });
                return Ok(Some(self.suspend_workflow(
                    args,
                    identifier,
                    ApprovalKind::ApiKeyRequired,
                    payload,
                    format!(
                        "dependency {} needs credential variables: {}",
                        dep.name,
                        report.problem_names().join(", ")
                    ),
                )));
            }
        }

        // Permission on the dependency's namespace.
        let namespace_id = ToolId::new(dep.name.clone(), "*".to_string());
        match self.inner.policy.check(&namespace_id) {
            PermissionDecision::Denied => {
                return Err(Error::new(
                    ErrorKind::ToolDenied,
                    format!("dependency namespace {} is denied by policy", dep.name),
                )
                .with("dependency", dep.name.as_str())
                .with("identifier", identifier));
            }
            PermissionDecision::Allowed => {}
            PermissionDecision::Ask if force_install => {
                tracing::info!(dep = %dep.name, "install approved by continuation");
            }
            PermissionDecision::Ask => {
                let payload = json!({
                    "dependency": {"name": dep.name, "version": dep.version},
                    "needs_installation": true,
                });
                return Ok(Some(self.suspend_workflow(
                    args,
                    identifier,
                    ApprovalKind::Dependency,
                    payload,
                    format!(
                        "capability {identifier} wants to install subprocess dependency {}@{}",
                        dep.name, dep.version
                    ),
                )));
            }
        }

        self.inner.installer.install(dep).await?;
        Ok(None)
    }

    /// Execute one action of a loaded capability, tracing every nested
    /// call and shipping the finalized trace.
    pub(crate) async fn dispatch_loaded(
        &self,
        capability: &Arc<LoadedCapability>,
        action: &str,
        args: Value,
    ) -> Result<Value> {
        // Server-routed capabilities run on the cloud endpoint.
        if capability.metadata.routing == RoutingPreference::Server {
            let tool = capability
                .tool_for_action(action)
                .unwrap_or_else(|| ToolId::new(capability.metadata.fqdn.clone(), action.to_string()));
            return remote_call(
                &self.inner.http,
                &self.inner.config.registry.cloud_url,
                &self.inner.config.registry.auth_token_env,
                &tool,
                args,
            )
            .await;
        }

        let collector = Arc::new(TraceCollector::new());
        let dispatcher: Arc<dyn ToolDispatcher> = Arc::new(Dispatcher {
            runtime: self.clone(),
            metadata: capability.metadata.clone(),
            collector: collector.clone(),
        });

        let result = self
            .inner
            .sandbox
            .execute(&capability.code, action, args, dispatcher)
            .await;

        let (success, error_message) = match &result {
            Ok(_) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };
        match collector.finalize(&capability.metadata.fqdn, success, error_message, None) {
            Ok(trace) => self.inner.syncer.push(trace).await,
            Err(error) => {
                tracing::warn!(error = %error, "trace finalize failed");
            }
        }

        let output = result?;
        RuntimeEvent::ExecutionFinished {
            fqcn: capability.metadata.fqdn.clone(),
            action: action.to_string(),
            success: true,
            duration_ms: output.duration_ms,
        }
        .emit();
        Ok(attach_ui(output.value, &output.ui_resources))
    }
}

/// Attach collected UI resources to the result, when any were recorded.
fn attach_ui(value: Value, ui_resources: &[caprun_sandbox::UiResource]) -> Value {
    if ui_resources.is_empty() {
        return value;
    }
    let resources = serde_json::to_value(ui_resources).unwrap_or(Value::Null);
    match value {
        Value::Object(mut map) => {
            map.insert("_collected_ui".into(), resources);
            Value::Object(map)
        }
        other => json!({ "value": other, "_collected_ui": resources }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher — nested calls out of the sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes the `mcp.*` calls one execution makes: declared subprocess
/// dependencies first, then the routing table (remote endpoint or a
/// recursive capability load). Every call, and every branch the code
/// reports through `caprun.branch`, is observed by the trace collector.
struct Dispatcher {
    runtime: Runtime,
    metadata: Arc<CapabilityMetadata>,
    collector: Arc<TraceCollector>,
}

#[async_trait]
impl ToolDispatcher for Dispatcher {
    async fn call_tool(&self, identifier: &str, args: Value, parent_trace_id: &str) -> Result<Value> {
        let started = std::time::Instant::now();
        let result = self.route(identifier, args.clone(), parent_trace_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let observed = match &result {
            Ok(value) => value.clone(),
            Err(err) => json!({ "error": err.to_string() }),
        };
        if let Err(error) =
            self.collector
                .record_mcp_call(identifier, args, observed, duration_ms, result.is_ok())
        {
            tracing::warn!(error = %error, "trace record failed");
        }
        result
    }

    fn record_branch(&self, node_id: &str, outcome: &str, condition: Option<String>) {
        if let Err(error) = self.collector.record_branch(node_id, outcome, condition) {
            tracing::warn!(error = %error, "trace branch record failed");
        }
    }
}

impl Dispatcher {
    async fn route(&self, identifier: &str, args: Value, parent_trace_id: &str) -> Result<Value> {
        let tool: ToolId = identifier.parse()?;

        // Declared subprocess dependencies win over the routing table.
        // The subprocess only knows bare action names.
        if let Some(dep) = self.metadata.dep_for_namespace(&tool.namespace) {
            self.runtime.inner.subprocesses.get_or_spawn(dep).await?;
            return self
                .runtime
                .inner
                .subprocesses
                .call(
                    &dep.name,
                    "tools/call",
                    json!({ "name": tool.action, "arguments": args }),
                )
                .await;
        }

        match self.runtime.inner.routing.classify_id(&tool) {
            Route::Remote => {
                remote_call(
                    &self.runtime.inner.http,
                    &self.runtime.inner.config.registry.cloud_url,
                    &self.runtime.inner.config.registry.auth_token_env,
                    &tool,
                    args,
                )
                .await
            }
            Route::Local => {
                tracing::debug!(
                    tool = %tool,
                    parent = parent_trace_id,
                    "recursive capability call"
                );
                match self.runtime.call(identifier, args, None).await? {
                    CallOutcome::Completed(value) => Ok(value),
                    // A nested load that needs consent surfaces the
                    // envelope as the call's value; the capability code
                    // decides what to do with it.
                    CallOutcome::ApprovalRequired(envelope) => {
                        Ok(serde_json::to_value(envelope).unwrap_or(Value::Null))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_ui_wraps_non_object_values() {
        let ui = vec![caprun_sandbox::UiResource {
            source: "weather:today".into(),
            resource_uri: "ui://card".into(),
            slot: 0,
            context: json!({}),
        }];
        let wrapped = attach_ui(json!("plain"), &ui);
        assert_eq!(wrapped["value"], "plain");
        assert_eq!(wrapped["_collected_ui"][0]["resource_uri"], "ui://card");
    }

    #[test]
    fn attach_ui_augments_objects_in_place() {
        let ui = vec![caprun_sandbox::UiResource {
            source: "weather:today".into(),
            resource_uri: "ui://card".into(),
            slot: 0,
            context: json!({}),
        }];
        let wrapped = attach_ui(json!({"data": 1}), &ui);
        assert_eq!(wrapped["data"], 1);
        assert!(wrapped["_collected_ui"].is_array());
    }

    #[test]
    fn attach_ui_without_resources_is_identity() {
        assert_eq!(attach_ui(json!({"a": 1}), &[]), json!({"a": 1}));
    }
}
