//! Shared structured error type used across all caprun crates.
//!
//! Every failure in the runtime carries a closed [`ErrorKind`], a
//! human-readable message, and a structured context map. The identifier
//! being processed is always placed in context by the call site.
//! Approval envelopes are deliberately *not* errors — they travel through
//! [`crate::envelope::CallOutcome`] instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of error kinds for the runtime core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    MetadataFetchFailed,
    MetadataParseError,
    EnvMissing,
    DependencyNotApproved,
    DependencyInstallFailed,
    DependencyIntegrityFailed,
    ModuleImportFailed,
    MethodNotFound,
    SubprocessSpawnFailed,
    SubprocessCallFailed,
    SubprocessTimeout,
    ExecutionTimeout,
    RpcTimeout,
    WorkerTerminated,
    CodeError,
    WorkflowNotFound,
    ToolDenied,
    PathOutsideWorkspace,
    PathTraversalAttack,
}

impl ErrorKind {
    /// The kebab-case wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataFetchFailed => "metadata-fetch-failed",
            Self::MetadataParseError => "metadata-parse-error",
            Self::EnvMissing => "env-missing",
            Self::DependencyNotApproved => "dependency-not-approved",
            Self::DependencyInstallFailed => "dependency-install-failed",
            Self::DependencyIntegrityFailed => "dependency-integrity-failed",
            Self::ModuleImportFailed => "module-import-failed",
            Self::MethodNotFound => "method-not-found",
            Self::SubprocessSpawnFailed => "subprocess-spawn-failed",
            Self::SubprocessCallFailed => "subprocess-call-failed",
            Self::SubprocessTimeout => "subprocess-timeout",
            Self::ExecutionTimeout => "execution-timeout",
            Self::RpcTimeout => "rpc-timeout",
            Self::WorkerTerminated => "worker-terminated",
            Self::CodeError => "code-error",
            Self::WorkflowNotFound => "workflow-not-found",
            Self::ToolDenied => "tool-denied",
            Self::PathOutsideWorkspace => "path-outside-workspace",
            Self::PathTraversalAttack => "path-traversal-attack",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured runtime error: kind + message + context map.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Map::new(),
        }
    }

    /// Attach a context entry. Chainable.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the tool identifier being processed.
    pub fn with_tool(self, tool: impl fmt::Display) -> Self {
        self.with("tool", tool.to_string())
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

pub type Result<T> = std::result::Result<T, Error>;
