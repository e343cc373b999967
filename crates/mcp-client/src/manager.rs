//! Subprocess manager — one lazily-spawned server per dependency name.
//!
//! Spawning performs the MCP handshake (`initialize` → response →
//! `notifications/initialized`) and discovers tools. Every successful
//! call refreshes the handle's last-activity timestamp, re-arming its
//! idle timer; a handle idle past the window is shut down silently. A
//! crashed handle is not revived inside the current call — the call
//! fails and the next `get_or_spawn` starts fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use caprun_domain::capability::SubprocessDep;
use caprun_domain::config::SubprocessConfig;
use caprun_domain::error::{Error, ErrorKind, Result};
use caprun_domain::events::RuntimeEvent;

use crate::protocol::{self, McpToolDef, ToolsListResult};
use crate::transport::{McpTransport, StdioTransport};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ServerHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A running subprocess server and its idle bookkeeping.
struct ServerHandle {
    name: String,
    transport: Arc<dyn McpTransport>,
    tools: Vec<McpToolDef>,
    last_activity: SyncMutex<Instant>,
    idle_cancel: CancellationToken,
}

type HandleMap = Arc<Mutex<HashMap<String, Arc<ServerHandle>>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubprocessManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide map of running subprocess servers, keyed by dependency
/// name (which is also the namespace their tools are reached under).
pub struct SubprocessManager {
    handles: HandleMap,
    config: SubprocessConfig,
}

impl SubprocessManager {
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_sec)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout_sec)
    }

    /// Ensure a live handle exists for the dependency, spawning and
    /// handshaking when needed.
    pub async fn get_or_spawn(&self, dep: &SubprocessDep) -> Result<()> {
        let mut handles = self.handles.lock().await;

        if let Some(handle) = handles.get(&dep.name) {
            if handle.transport.is_alive() {
                return Ok(());
            }
            // Crash detected lazily: drop the dead handle, spawn fresh.
            tracing::warn!(dep = %dep.name, "found dead subprocess handle, respawning");
            if let Some(dead) = handles.remove(&dep.name) {
                dead.idle_cancel.cancel();
            }
        }

        let transport: Arc<dyn McpTransport> =
            Arc::new(StdioTransport::spawn(dep, self.request_timeout())?);

        if let Err(error) = handshake(transport.as_ref()).await {
            transport.shutdown().await;
            return Err(Error::new(
                ErrorKind::SubprocessSpawnFailed,
                format!("handshake with {:?} failed: {}", dep.name, error.message),
            )
            .with("dependency", dep.name.as_str())
            .with("cause", error.kind.as_str()));
        }

        // Tool discovery is best-effort: a server without tools/list
        // still serves calls.
        let tools = match transport.send_request("tools/list", None).await {
            Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                Ok(result) => result.tools,
                Err(error) => {
                    tracing::warn!(dep = %dep.name, error = %error, "unparseable tools/list result");
                    Vec::new()
                }
            },
            Err(error) => {
                tracing::warn!(dep = %dep.name, error = %error, "tools/list failed, continuing without discovery");
                Vec::new()
            }
        };

        RuntimeEvent::SubprocessSpawned {
            name: dep.name.clone(),
            tool_count: tools.len(),
        }
        .emit();

        let handle = Arc::new(ServerHandle {
            name: dep.name.clone(),
            transport,
            tools,
            last_activity: SyncMutex::new(Instant::now()),
            idle_cancel: CancellationToken::new(),
        });
        handles.insert(dep.name.clone(), handle.clone());
        spawn_idle_watchdog(self.handles.clone(), handle, self.idle_timeout());
        Ok(())
    }

    /// Send a request to the handle keyed by `name`. A successful call
    /// refreshes the idle timer.
    pub async fn call(&self, name: &str, method: &str, params: Value) -> Result<Value> {
        let handle = {
            let handles = self.handles.lock().await;
            handles.get(name).cloned()
        }
        .ok_or_else(|| {
            Error::new(
                ErrorKind::SubprocessCallFailed,
                format!("no running subprocess for namespace {name:?}"),
            )
            .with("dependency", name)
        })?;

        let result = handle.transport.send_request(method, Some(params)).await?;
        *handle.last_activity.lock() = Instant::now();
        Ok(result)
    }

    /// Shut down one handle. Unknown names are a no-op.
    pub async fn shutdown(&self, name: &str) {
        let handle = self.handles.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.idle_cancel.cancel();
            handle.transport.shutdown().await;
            tracing::info!(dep = %name, "subprocess shut down");
        }
    }

    /// Shut down everything: all idle timers are cleared first, then
    /// the handles are torn down one by one.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<ServerHandle>> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, h)| h).collect()
        };
        for handle in &drained {
            handle.idle_cancel.cancel();
        }
        let teardowns: Vec<_> = drained
            .iter()
            .map(|handle| handle.transport.shutdown())
            .collect();
        futures_util::future::join_all(teardowns).await;
        tracing::info!("all subprocess handles shut down");
    }

    // ── Observability ───────────────────────────────────────────────

    /// Names of currently running handles.
    pub async fn running(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        handles
            .values()
            .filter(|h| h.transport.is_alive())
            .map(|h| h.name.clone())
            .collect()
    }

    /// Discovered tools of a running handle.
    pub async fn tools(&self, name: &str) -> Option<Vec<McpToolDef>> {
        let handles = self.handles.lock().await;
        handles.get(name).map(|h| h.tools.clone())
    }

    /// In-flight request count of a running handle.
    pub async fn pending_count(&self, name: &str) -> Option<usize> {
        let handles = self.handles.lock().await;
        handles.get(name).map(|h| h.transport.pending_count())
    }

    /// Test seam: install a handle with an arbitrary transport.
    #[cfg(test)]
    async fn insert_for_test(&self, name: &str, transport: Arc<dyn McpTransport>) {
        let handle = Arc::new(ServerHandle {
            name: name.to_string(),
            transport,
            tools: Vec::new(),
            last_activity: SyncMutex::new(Instant::now()),
            idle_cancel: CancellationToken::new(),
        });
        self.handles.lock().await.insert(name.to_string(), handle.clone());
        spawn_idle_watchdog(self.handles.clone(), handle, self.idle_timeout());
    }
}

/// `initialize` → await response → `notifications/initialized`.
async fn handshake(transport: &dyn McpTransport) -> Result<()> {
    let params = serde_json::to_value(protocol::initialize_params()).map_err(|error| {
        Error::new(
            ErrorKind::SubprocessSpawnFailed,
            format!("initialize params serialization failed: {error}"),
        )
    })?;
    transport.send_request("initialize", Some(params)).await?;
    transport
        .send_notification("notifications/initialized", None)
        .await
}

/// Watchdog task: shuts the handle down once it has been idle for the
/// whole window. A refreshed timestamp re-arms the deadline; a
/// cancelled token (shutdown paths) disarms the timer for good.
fn spawn_idle_watchdog(handles: HandleMap, handle: Arc<ServerHandle>, idle: Duration) {
    let token = handle.idle_cancel.clone();
    tokio::spawn(async move {
        loop {
            let deadline = *handle.last_activity.lock() + idle;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() < *handle.last_activity.lock() + idle {
                        // Activity arrived while we slept; re-arm.
                        continue;
                    }
                    RuntimeEvent::SubprocessIdleExpired {
                        name: handle.name.clone(),
                    }
                    .emit();
                    let mut map = handles.lock().await;
                    // Only remove the handle we own; a respawn may have
                    // replaced it already.
                    if map.get(&handle.name).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
                        map.remove(&handle.name);
                    }
                    drop(map);
                    handle.transport.shutdown().await;
                    return;
                }
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory transport that answers every request immediately.
    struct FakeTransport {
        alive: AtomicBool,
        calls: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        async fn send_request(&self, _method: &str, _params: Option<Value>) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"ok": true}))
        }

        async fn send_notification(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn pending_count(&self) -> usize {
            0
        }

        async fn shutdown(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(idle_sec: u64) -> SubprocessConfig {
        SubprocessConfig {
            request_timeout_sec: 30,
            idle_timeout_sec: idle_sec,
        }
    }

    /// Let woken background tasks (watchdogs) run to their next await.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn call_on_unknown_namespace_fails() {
        let manager = SubprocessManager::new(config(300));
        let err = manager
            .call("ghost", "tools/call", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SubprocessCallFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_shuts_down_silently() {
        let manager = SubprocessManager::new(config(300));
        let fake = FakeTransport::new();
        manager.insert_for_test("memory", fake.clone()).await;
        assert_eq!(manager.running().await, vec!["memory".to_string()]);

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert!(manager.running().await.is_empty());
        assert_eq!(fake.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_call_rearms_idle_timer() {
        let manager = SubprocessManager::new(config(300));
        let fake = FakeTransport::new();
        manager.insert_for_test("memory", fake.clone()).await;

        // Just before the window expires, a call refreshes activity.
        tokio::time::advance(Duration::from_secs(299)).await;
        manager
            .call("memory", "tools/call", serde_json::json!({}))
            .await
            .unwrap();

        // The original deadline passes without a shutdown.
        tokio::time::advance(Duration::from_secs(200)).await;
        settle().await;
        assert_eq!(manager.running().await, vec!["memory".to_string()]);

        // A full idle window with no calls does shut it down.
        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;
        assert!(manager.running().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_cancels_timers_and_tears_down() {
        let manager = SubprocessManager::new(config(300));
        let a = FakeTransport::new();
        let b = FakeTransport::new();
        manager.insert_for_test("a", a.clone()).await;
        manager.insert_for_test("b", b.clone()).await;

        manager.shutdown_all().await;
        assert!(manager.running().await.is_empty());
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_unknown_name_is_noop() {
        let manager = SubprocessManager::new(config(300));
        manager.shutdown("ghost").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn get_or_spawn_handshakes_and_discovers_tools() {
        // Answers initialize (id 1) and tools/list (id 2), then keeps
        // reading so the pipe stays open.
        let script = r#"
            read line
            printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n'
            read line
            read line
            printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"store"}]}}\n'
            cat > /dev/null
        "#;
        let dep = SubprocessDep {
            name: "memory".into(),
            transport: Default::default(),
            install: String::new(),
            version: "1.0.0".into(),
            integrity: "sha256-abc".into(),
            env_required: vec![],
            command: Some("sh".into()),
            args: Some(vec!["-c".into(), script.into()]),
        };

        let manager = SubprocessManager::new(config(300));
        manager.get_or_spawn(&dep).await.unwrap();

        // Spawning again while alive is a no-op.
        manager.get_or_spawn(&dep).await.unwrap();

        let tools = manager.tools("memory").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "store");

        manager.shutdown_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_silence_fails_spawn() {
        let dep = SubprocessDep {
            name: "mute".into(),
            transport: Default::default(),
            install: "cat".into(),
            version: "1.0.0".into(),
            integrity: "sha256-abc".into(),
            env_required: vec![],
            command: None,
            args: None,
        };
        let manager = SubprocessManager::new(SubprocessConfig {
            request_timeout_sec: 1,
            idle_timeout_sec: 300,
        });
        let err = manager.get_or_spawn(&dep).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SubprocessSpawnFailed);
        assert_eq!(err.context.get("cause").unwrap(), "subprocess-timeout");
        assert!(manager.running().await.is_empty());
    }
}
