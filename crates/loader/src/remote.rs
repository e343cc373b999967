//! Remote tool dispatch over the cloud endpoint.
//!
//! `POST <cloud_url>/mcp/tools/call` with a JSON-RPC 2.0 envelope and a
//! bearer credential read from the configured environment variable.
//! HTTP-level failures surface as `subprocess-call-failed`; an embedded
//! JSON-RPC error surfaces its own message.

use serde_json::{json, Value};

use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::identifier::ToolId;

pub(crate) async fn remote_call(
    http: &reqwest::Client,
    cloud_url: &str,
    auth_token_env: &str,
    tool: &ToolId,
    args: Value,
) -> Result<Value> {
    let token = std::env::var(auth_token_env)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::EnvMissing,
                format!("credential variable {auth_token_env} is not set"),
            )
            .with("variable", auth_token_env)
            .with_tool(tool)
        })?;

    let envelope = json!({
        "jsonrpc": "2.0",
        "id": chrono::Utc::now().timestamp_millis(),
        "method": "tools/call",
        "params": { "name": tool.to_string(), "arguments": args },
    });

    tracing::debug!(tool = %tool, url = %cloud_url, "forwarding tool call to cloud endpoint");

    let response = http
        .post(format!("{}/mcp/tools/call", cloud_url.trim_end_matches('/')))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .bearer_auth(token)
        .json(&envelope)
        .send()
        .await
        .map_err(|error| {
            Error::new(
                ErrorKind::SubprocessCallFailed,
                format!("cloud endpoint unreachable: {error}"),
            )
            .with_tool(tool)
        })?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(Error::new(
            ErrorKind::SubprocessCallFailed,
            format!("cloud endpoint answered HTTP {status}"),
        )
        .with_tool(tool)
        .with("status", status.as_u16()));
    }

    let body: Value = response.json().await.map_err(|error| {
        Error::new(
            ErrorKind::SubprocessCallFailed,
            format!("cloud endpoint body is not JSON: {error}"),
        )
        .with_tool(tool)
    })?;

    if let Some(rpc_error) = body.get("error") {
        let message = rpc_error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remote tool call failed")
            .to_string();
        return Err(Error::new(ErrorKind::SubprocessCallFailed, message)
            .with_tool(tool)
            .with("error", rpc_error.clone()));
    }

    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}
