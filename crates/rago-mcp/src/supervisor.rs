//! Per-server supervisor task
//!
//! Each configured server gets one long-lived task that owns its lifecycle:
//!
//! ```text
//! not-started --start--> starting --handshake ok--> running
//!                            |                         |
//!                            +----failure----> crashed <+-- process exit
//!                                                 |
//!                     restart_count < max_restarts? backoff, then starting
//!                                     otherwise --> stopped
//! ```
//!
//! Commands (start, stop, enable) arrive on a single-writer mailbox. State is
//! published on a watch channel so callers can wait for a server to settle.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rago_core::{CancellationToken, Component, ErrorKind, RagoError, RagoResult, ServerState};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::events::ToolEvent;
use crate::host::HostShared;
use crate::launcher::Launcher;
use crate::protocol::{self, RemoteTool};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Stop,
    /// Clear the restart counter and start again
    Enable,
}

#[derive(Debug, Default)]
pub(crate) struct Runtime {
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_success: Option<Instant>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub server_info: Value,
    pub tools: Vec<RemoteTool>,
}

pub(crate) struct ServerHandle {
    pub config: ServerConfig,
    state: watch::Sender<ServerState>,
    pub runtime: Mutex<Runtime>,
    session: ArcSwapOption<Session>,
    commands: mpsc::Sender<Command>,
}

impl ServerHandle {
    pub fn new(config: ServerConfig) -> (Arc<Self>, mpsc::Receiver<Command>) {
        let (state, _) = watch::channel(ServerState::NotStarted);
        let (commands, mailbox) = mpsc::channel(16);
        let handle = Arc::new(Self {
            config,
            state,
            runtime: Mutex::new(Runtime::default()),
            session: ArcSwapOption::empty(),
            commands,
        });
        (handle, mailbox)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    pub fn record_success(&self) {
        let mut runtime = self.runtime.lock();
        runtime.last_success = Some(Instant::now());
        runtime.last_success_at = Some(Utc::now());
    }

    fn set_state(&self, to: ServerState, events: &broadcast::Sender<ToolEvent>) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(server = %self.config.name, from = %from, to = %to, "Tool server state changed");
            let _ = events.send(ToolEvent::StateChanged {
                server: self.config.name.clone(),
                from,
                to,
            });
        }
    }

    pub async fn send(&self, command: Command) -> RagoResult<()> {
        self.commands.send(command).await.map_err(|_| {
            RagoError::new(
                ErrorKind::ToolServerUnavailable,
                format!("supervisor for '{}' is not running", self.config.name),
            )
            .at(Component::Tools, "supervise")
        })
    }

    fn unavailable(&self, operation: &str, detail: &str) -> RagoError {
        RagoError::new(
            ErrorKind::ToolServerUnavailable,
            format!("tool server '{}' is {}", self.config.name, detail),
        )
        .at(Component::Tools, operation.to_string())
    }

    /// Waits until the server is running, or fails once it stops or the deadline passes
    pub async fn wait_running(&self, deadline: Instant, operation: &str) -> RagoResult<Arc<Session>> {
        let mut watcher = self.state.subscribe();
        loop {
            let state = *watcher.borrow_and_update();
            match state {
                ServerState::Running => {
                    if let Some(session) = self.session() {
                        return Ok(session);
                    }
                }
                ServerState::Stopped => return Err(self.unavailable(operation, "stopped")),
                _ => {}
            }
            tokio::select! {
                changed = watcher.changed() => {
                    if changed.is_err() {
                        return Err(self.unavailable(operation, "gone"));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let detail = format!("not running ({})", self.state());
                    return Err(self.unavailable(operation, &detail));
                }
            }
        }
    }

    /// Waits for running or stopped, whichever comes first
    pub async fn wait_settled(&self, timeout: Duration) -> ServerState {
        self.wait_until(settled, timeout).await
    }

    /// Sends `command` and waits for the state it leads to settle
    pub async fn command_and_settle(&self, command: Command, timeout: Duration) -> RagoResult<ServerState> {
        let before = self.state();
        match (command, before) {
            (Command::Start | Command::Enable, ServerState::Running) => return Ok(before),
            (Command::Stop, ServerState::NotStarted | ServerState::Stopped) => return Ok(before),
            _ => {}
        }
        self.send(command).await?;
        let mut moved = false;
        let target = move |state: ServerState| {
            moved |= state != before;
            match command {
                Command::Stop => state == ServerState::Stopped,
                _ => moved && settled(state),
            }
        };
        Ok(self.wait_until(target, timeout).await)
    }

    async fn wait_until<F>(&self, mut done: F, timeout: Duration) -> ServerState
    where
        F: FnMut(ServerState) -> bool,
    {
        let mut watcher = self.state.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let state = *watcher.borrow_and_update();
            if done(state) {
                return state;
            }
            tokio::select! {
                changed = watcher.changed() => {
                    if changed.is_err() {
                        return self.state();
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return self.state(),
            }
        }
    }
}

fn settled(state: ServerState) -> bool {
    matches!(state, ServerState::Running | ServerState::Stopped)
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a supervisor needs from the host
#[derive(Clone)]
pub(crate) struct SupervisorContext {
    pub launcher: Arc<dyn Launcher>,
    pub events: broadcast::Sender<ToolEvent>,
    pub shutdown: CancellationToken,
    pub grace: Duration,
    pub check_interval: Duration,
    pub host: Weak<HostShared>,
}

impl SupervisorContext {
    fn republish(&self) {
        if let Some(host) = self.host.upgrade() {
            host.republish();
        }
    }
}

enum Exit {
    Crashed(String),
    Stopped,
    Shutdown,
}

pub(crate) async fn supervise(
    handle: Arc<ServerHandle>,
    ctx: SupervisorContext,
    mut commands: mpsc::Receiver<Command>,
) {
    let events = ctx.events.clone();
    loop {
        match handle.state() {
            ServerState::NotStarted | ServerState::Stopped => {
                let command = tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    command = commands.recv() => command,
                };
                match command {
                    None => break,
                    Some(Command::Start) => handle.set_state(ServerState::Starting, &events),
                    Some(Command::Enable) => {
                        handle.runtime.lock().restart_count = 0;
                        handle.set_state(ServerState::Starting, &events);
                    }
                    Some(Command::Stop) => {}
                }
            }

            ServerState::Starting => {
                let connected = tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    connected = connect(&handle, &ctx) => connected,
                };
                match connected {
                    Ok(session) => {
                        handle.session.store(Some(session));
                        handle.record_success();
                        handle.set_state(ServerState::Running, &events);
                        ctx.republish();
                    }
                    Err(e) => {
                        warn!(server = %handle.name(), error = %e, "Tool server failed to start");
                        handle.runtime.lock().last_error = Some(e.to_string());
                        handle.set_state(ServerState::Crashed, &events);
                    }
                }
            }

            ServerState::Running => {
                let exit = match handle.session() {
                    Some(session) => run_session(&handle, &session, &ctx, &mut commands).await,
                    None => Exit::Crashed("session missing".to_string()),
                };
                handle.session.store(None);
                match exit {
                    Exit::Crashed(reason) => {
                        warn!(server = %handle.name(), reason = %reason, "Tool server crashed");
                        handle.runtime.lock().last_error = Some(reason);
                        handle.set_state(ServerState::Crashed, &events);
                        ctx.republish();
                    }
                    Exit::Stopped => {
                        handle.set_state(ServerState::Stopped, &events);
                        ctx.republish();
                    }
                    Exit::Shutdown => break,
                }
            }

            ServerState::Crashed => {
                let attempt = {
                    let mut runtime = handle.runtime.lock();
                    if runtime.restart_count >= handle.config.max_restarts {
                        None
                    } else {
                        runtime.restart_count += 1;
                        Some(runtime.restart_count)
                    }
                };
                let Some(attempt) = attempt else {
                    error!(
                        server = %handle.name(),
                        restarts = handle.config.max_restarts,
                        "Restart limit reached; tool server stopped until re-enabled"
                    );
                    handle.set_state(ServerState::Stopped, &events);
                    ctx.republish();
                    continue;
                };

                let delay = handle.config.restart_backoff(attempt);
                info!(
                    server = %handle.name(),
                    attempt,
                    max = handle.config.max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "Restarting tool server"
                );
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => handle.set_state(ServerState::Starting, &events),
                    command = commands.recv() => match command {
                        None => break,
                        Some(Command::Stop) => handle.set_state(ServerState::Stopped, &events),
                        Some(Command::Enable) => {
                            handle.runtime.lock().restart_count = 0;
                            handle.set_state(ServerState::Starting, &events);
                        }
                        Some(Command::Start) => handle.set_state(ServerState::Starting, &events),
                    },
                }
            }
        }
    }

    if let Some(session) = handle.session.swap(None) {
        session.close(ctx.grace).await;
    }
    if handle.state() != ServerState::NotStarted {
        handle.set_state(ServerState::Stopped, &events);
    }
}

async fn connect(handle: &ServerHandle, ctx: &SupervisorContext) -> RagoResult<Arc<Session>> {
    let config = &handle.config;
    let connection = ctx.launcher.launch(config).await?;
    let session = Session::open(
        &config.name,
        connection,
        config.framing,
        config.max_in_flight,
        ctx.events.clone(),
    );
    match session.handshake(config.handshake_timeout(), &ctx.shutdown).await {
        Ok(handshake) => {
            info!(
                server = %config.name,
                tools = handshake.tools.len(),
                "Tool server ready"
            );
            let mut runtime = handle.runtime.lock();
            runtime.server_info = handshake.server_info;
            runtime.tools = handshake.tools;
            runtime.last_error = None;
            drop(runtime);
            Ok(session)
        }
        Err(e) => {
            session.kill();
            Err(e)
        }
    }
}

/// Drives a running session until it exits, is stopped, or the host shuts down
async fn run_session(
    handle: &ServerHandle,
    session: &Arc<Session>,
    ctx: &SupervisorContext,
    commands: &mut mpsc::Receiver<Command>,
) -> Exit {
    let mut probe = tokio::time::interval_at(Instant::now() + ctx.check_interval, ctx.check_interval);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let never = CancellationToken::new();

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                session.close(ctx.grace).await;
                return Exit::Shutdown;
            }
            _ = session.closed() => {
                session.kill();
                return Exit::Crashed("process exited".to_string());
            }
            command = commands.recv() => match command {
                Some(Command::Stop) | None => {
                    info!(server = %handle.name(), "Stopping tool server");
                    session.close(ctx.grace).await;
                    return Exit::Stopped;
                }
                Some(Command::Start) | Some(Command::Enable) => {}
            },
            _ = probe.tick() => {
                let ping = session
                    .request(protocol::METHOD_PING, json!({}), ctx.check_interval, &never, Duration::ZERO)
                    .await;
                match ping {
                    Ok(_) => handle.record_success(),
                    // a server without ping still answered
                    Err(e) if e.kind() == ErrorKind::NotFound => handle.record_success(),
                    Err(e) => {
                        warn!(server = %handle.name(), error = %e, "Liveness probe failed");
                        handle.runtime.lock().last_error = Some(e.to_string());
                    }
                }
            }
        }
    }
}
