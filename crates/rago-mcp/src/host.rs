//! The tool host: supervised servers, merged catalog and call dispatch

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rago_core::{
    CancellationToken, Component, ErrorKind, HealthStatus, RagoError, RagoResult, ServerState,
    ToolDescriptor, ToolOutput,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{self, ResponseCache};
use crate::catalog::{Catalog, ServerTools};
use crate::config::{McpConfig, ServerConfig};
use crate::events::ToolEvent;
use crate::launcher::{Launcher, ProcessLauncher};
use crate::protocol;
use crate::schema::validate_arguments;
use crate::supervisor::{supervise, Command, ServerHandle, SupervisorContext};

const EVENT_CAPACITY: usize = 256;

/// One entry of a batch call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub name: String,
    pub arguments: Value,
    pub timeout: Option<Duration>,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot of one server for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub restart_count: u32,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub server_info: Value,
    pub health: HealthStatus,
}

pub(crate) struct HostShared {
    config: McpConfig,
    launcher: Arc<dyn Launcher>,
    events: broadcast::Sender<ToolEvent>,
    servers: RwLock<Vec<Arc<ServerHandle>>>,
    catalog: ArcSwap<Catalog>,
    cache: Option<ResponseCache>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HostShared {
    /// Rebuilds the catalog from every server's last known tool list
    pub(crate) fn republish(&self) {
        let servers = self.servers.read();
        let runtimes: Vec<_> = servers
            .iter()
            .map(|s| (s.name().to_string(), s.state(), s.runtime.lock().tools.clone()))
            .collect();
        drop(servers);

        let catalog = Catalog::build(runtimes.iter().map(|(server, state, tools)| ServerTools {
            server,
            running: *state == ServerState::Running,
            tools,
        }));
        debug!(tools = catalog.tools().len(), "Tool catalog republished");
        self.catalog.store(Arc::new(catalog));
    }

    fn server(&self, name: &str) -> Option<Arc<ServerHandle>> {
        self.servers.read().iter().find(|s| s.name() == name).cloned()
    }

    fn context(self: &Arc<Self>) -> SupervisorContext {
        SupervisorContext {
            launcher: self.launcher.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            grace: self.config.hard_cancel_timeout(),
            check_interval: self.config.check_interval(),
            host: Arc::downgrade(self),
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, config: ServerConfig) -> Arc<ServerHandle> {
        let (handle, mailbox) = ServerHandle::new(config);
        let task = tokio::spawn(supervise(handle.clone(), self.context(), mailbox));
        self.tasks.lock().push(task);
        self.servers.write().push(handle.clone());
        handle
    }
}

/// Supervises tool servers and dispatches calls to them
///
/// Dropping the host signals every supervisor to stop its server.
pub struct ToolHost {
    shared: Arc<HostShared>,
    started: AtomicBool,
}

impl ToolHost {
    pub fn new(config: McpConfig) -> RagoResult<Self> {
        Self::with_launcher(config, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(config: McpConfig, launcher: Arc<dyn Launcher>) -> RagoResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = config
            .enable_cache
            .then(|| ResponseCache::new(config.cache_ttl()));
        Ok(Self {
            shared: Arc::new(HostShared {
                config,
                launcher,
                events,
                servers: RwLock::new(Vec::new()),
                catalog: ArcSwap::from_pointee(Catalog::default()),
                cache,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &McpConfig {
        &self.shared.config
    }

    /// Spawns a supervisor per configured server and starts the eager ones
    ///
    /// Servers that fail to come up do not fail the host; they restart in
    /// the background and show up in [`ToolHost::health`].
    #[instrument(skip_all)]
    pub async fn start(&self) -> RagoResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.shared.config.enabled {
            info!("Tool host disabled");
            return Ok(());
        }

        let mut eager = Vec::new();
        for server in self.shared.config.servers.clone() {
            let auto_start = server.auto_start;
            let handle = self.shared.spawn_supervisor(server);
            if auto_start {
                handle.send(Command::Start).await?;
                eager.push(handle);
            }
        }
        self.shared.republish();

        let settled = futures::future::join_all(
            eager
                .iter()
                .map(|h| h.wait_settled(h.config.handshake_timeout())),
        )
        .await;
        self.shared.republish();
        let running = settled.iter().filter(|s| **s == ServerState::Running).count();
        if running < eager.len() {
            warn!(running, expected = eager.len(), "Some tool servers did not start");
        }
        info!(
            running,
            tools = self.shared.catalog.load().tools().len(),
            "Tool host started"
        );
        Ok(())
    }

    /// Registers and (when the host is started and the server is eager) starts a new server
    pub async fn add_server(&self, config: ServerConfig) -> RagoResult<()> {
        if self.shared.server(&config.name).is_some() {
            return Err(RagoError::conflict(format!(
                "tool server '{}' already registered",
                config.name
            ))
            .at(Component::Tools, "add_server"));
        }
        McpConfig::default().with_server(config.clone()).validate()?;
        let auto_start = config.auto_start;
        let handle = self.shared.spawn_supervisor(config);
        if auto_start && self.started.load(Ordering::SeqCst) {
            handle.send(Command::Start).await?;
            handle.wait_settled(handle.config.handshake_timeout()).await;
        }
        self.shared.republish();
        Ok(())
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.shared.catalog.load().tools().to_vec()
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.shared.catalog.load().get(name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolEvent> {
        self.shared.events.subscribe()
    }

    /// Starts lazily configured servers that could own `name`
    async fn start_lazy_for(&self, name: &str, deadline: Instant) -> bool {
        let owner = name.split_once('.').map(|(server, _)| server);
        let candidates: Vec<_> = self
            .shared
            .servers
            .read()
            .iter()
            .filter(|s| s.state() == ServerState::NotStarted)
            .filter(|s| owner.map_or(true, |o| o == s.name()))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return false;
        }
        for server in &candidates {
            debug!(server = %server.name(), tool = name, "Starting lazy tool server");
            let _ = server.send(Command::Start).await;
        }
        let budget = deadline.saturating_duration_since(Instant::now());
        futures::future::join_all(candidates.iter().map(|s| s.wait_settled(budget))).await;
        true
    }

    async fn resolve(&self, name: &str, deadline: Instant) -> RagoResult<(ToolDescriptor, Arc<ServerHandle>)> {
        let mut tool = self.get_tool(name);
        if tool.is_none() && self.start_lazy_for(name, deadline).await {
            self.shared.republish();
            tool = self.get_tool(name);
        }
        let tool = tool.ok_or_else(|| {
            RagoError::not_found(format!("unknown tool '{}'", name)).at(Component::Tools, "call_tool")
        })?;
        let server = self.shared.server(&tool.server_name).ok_or_else(|| {
            RagoError::internal(format!("tool '{}' has no owning server", name))
                .at(Component::Tools, "call_tool")
        })?;
        Ok((tool, server))
    }

    /// Validates, dispatches and awaits one tool call
    ///
    /// `timeout` defaults to the configured call timeout and covers waiting
    /// for a (re)starting server as well as the call itself.
    #[instrument(skip_all, fields(tool = %name))]
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RagoResult<ToolOutput> {
        if !self.shared.config.enabled {
            return Err(RagoError::new(ErrorKind::ToolServerUnavailable, "tool host is disabled")
                .at(Component::Tools, "call_tool"));
        }
        if cancel.is_cancelled() {
            return Err(RagoError::cancelled().at(Component::Tools, "call_tool"));
        }
        let timeout = timeout.unwrap_or_else(|| self.shared.config.call_timeout());
        let started = Instant::now();
        let deadline = started + timeout;

        let (tool, server) = self.resolve(name, deadline).await?;

        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let bypass = cache::wants_bypass(&arguments);
        let arguments = cache::strip_marker(arguments);

        for warning in validate_arguments(&tool.name, &tool.input_schema, &arguments)? {
            warn!(tool = %tool.name, "{}", warning);
            let _ = self.shared.events.send(ToolEvent::Warning {
                tool: tool.name.clone(),
                message: warning,
            });
        }

        let cache_key = match &self.shared.cache {
            Some(cache) if !bypass => {
                let key = ResponseCache::key(&tool.name, &arguments);
                if let Some(hit) = cache.get(&key) {
                    debug!(tool = %tool.name, "Tool cache hit");
                    return Ok(hit);
                }
                Some(key)
            }
            _ => None,
        };

        if server.state() == ServerState::NotStarted {
            server.send(Command::Start).await?;
        }
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RagoError::cancelled().at(Component::Tools, "call_tool"));
            }
            session = server.wait_running(deadline, "call_tool") => session?,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = session
            .request(
                protocol::METHOD_TOOLS_CALL,
                json!({"name": tool.remote_name, "arguments": arguments}),
                remaining,
                cancel,
                self.shared.config.hard_cancel_timeout(),
            )
            .await
            .map_err(|e| e.at(Component::Tools, "call_tool"))?;
        server.record_success();

        let is_error = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let output = ToolOutput {
            content: result,
            is_error,
            duration_ms: started.elapsed().as_millis() as u64,
            cached: false,
        };
        debug!(
            tool = %tool.name,
            server = %tool.server_name,
            is_error,
            duration_ms = output.duration_ms,
            "Tool call completed"
        );

        if let (Some(cache), Some(key)) = (&self.shared.cache, cache_key) {
            if !is_error {
                cache.put(key, output.clone());
            }
        }
        Ok(output)
    }

    /// Dispatches a call in the background and delivers its outcome on a channel
    pub fn call_async(
        self: &Arc<Self>,
        name: impl Into<String>,
        arguments: Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<RagoResult<ToolOutput>> {
        let (tx, rx) = oneshot::channel();
        let host = self.clone();
        let name = name.into();
        tokio::spawn(async move {
            let outcome = host.call_tool(&name, arguments, timeout, &cancel).await;
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Runs calls concurrently; results come back in input order and one
    /// failure does not affect the others
    pub async fn call_batch(
        &self,
        requests: Vec<ToolRequest>,
        cancel: &CancellationToken,
    ) -> Vec<RagoResult<ToolOutput>> {
        let concurrency = self.shared.config.batch_concurrency.max(1);
        stream::iter(requests)
            .map(|request| async move {
                self.call_tool(&request.name, request.arguments, request.timeout, cancel)
                    .await
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    fn server_or_not_found(&self, name: &str, operation: &str) -> RagoResult<Arc<ServerHandle>> {
        self.shared.server(name).ok_or_else(|| {
            RagoError::not_found(format!("unknown tool server '{}'", name))
                .at(Component::Tools, operation.to_string())
        })
    }

    /// Starts a server and waits for it to settle
    pub async fn start_server(&self, name: &str) -> RagoResult<ServerState> {
        let server = self.server_or_not_found(name, "start_server")?;
        let state = server
            .command_and_settle(Command::Start, server.config.handshake_timeout())
            .await?;
        self.shared.republish();
        Ok(state)
    }

    pub async fn stop_server(&self, name: &str) -> RagoResult<()> {
        let server = self.server_or_not_found(name, "stop_server")?;
        let grace = self.shared.config.hard_cancel_timeout() + Duration::from_secs(1);
        server.command_and_settle(Command::Stop, grace).await?;
        self.shared.republish();
        Ok(())
    }

    /// Clears the restart counter of a stopped server and starts it again
    pub async fn enable_server(&self, name: &str) -> RagoResult<ServerState> {
        let server = self.server_or_not_found(name, "enable_server")?;
        info!(server = name, "Re-enabling tool server");
        let state = server
            .command_and_settle(Command::Enable, server.config.handshake_timeout())
            .await?;
        self.shared.republish();
        Ok(state)
    }

    pub fn server_state(&self, name: &str) -> Option<ServerState> {
        self.shared.server(name).map(|s| s.state())
    }

    fn server_health(&self, server: &ServerHandle) -> HealthStatus {
        match server.state() {
            ServerState::Running => {
                let stale_after = self.shared.config.stale_after();
                let fresh = server
                    .runtime
                    .lock()
                    .last_success
                    .map_or(false, |t| t.elapsed() <= stale_after);
                if fresh {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
            ServerState::Starting | ServerState::Crashed => HealthStatus::Degraded,
            ServerState::Stopped => HealthStatus::Unhealthy,
            ServerState::NotStarted => HealthStatus::Unknown,
        }
    }

    pub fn server_status(&self) -> Vec<ServerStatus> {
        let catalog = self.shared.catalog.load();
        let servers: Vec<_> = self.shared.servers.read().iter().cloned().collect();
        servers
            .iter()
            .map(|server| {
                let health = self.server_health(server);
                let runtime = server.runtime.lock();
                ServerStatus {
                    name: server.name().to_string(),
                    state: server.state(),
                    restart_count: runtime.restart_count,
                    tool_count: catalog.count_for(server.name()),
                    last_error: runtime.last_error.clone(),
                    last_success: runtime.last_success_at,
                    server_info: runtime.server_info.clone(),
                    health,
                }
            })
            .collect()
    }

    /// Per-server health
    pub fn health(&self) -> BTreeMap<String, HealthStatus> {
        self.shared
            .servers
            .read()
            .iter()
            .map(|s| (s.name().to_string(), self.server_health(s)))
            .collect()
    }

    /// Tools pillar status; servers never started do not count
    pub fn pillar_status(&self) -> HealthStatus {
        if !self.shared.config.enabled {
            return HealthStatus::Unknown;
        }
        HealthStatus::aggregate(
            self.health()
                .into_values()
                .filter(|s| *s != HealthStatus::Unknown),
        )
    }

    /// Stops every server and waits for the supervisors to finish
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let tasks: Vec<_> = self.shared.tasks.lock().drain(..).collect();
        let grace = self.shared.config.hard_cancel_timeout() + Duration::from_secs(1);
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Tool server supervisor did not exit in time");
            }
        }
        info!("Tool host stopped");
    }
}

impl Drop for ToolHost {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for ToolHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHost")
            .field("servers", &self.shared.servers.read().len())
            .field("tools", &self.shared.catalog.load().tools().len())
            .finish()
    }
}
