//! A live JSON-RPC session with one tool server
//!
//! Two background tasks own the pipes: the writer drains an outgoing mailbox
//! into the server's stdin, the reader routes responses to their waiting
//! callers by request id and forwards notifications. Either side closing
//! marks the session closed and fails every pending request.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rago_core::{CancellationToken, Component, ErrorKind, RagoError, RagoResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::{Frame, Framing, JsonRpcCodec};
use crate::events::{parse_log, trace_server_log, ToolEvent};
use crate::launcher::{BoxedReader, BoxedWriter, Connection};
use crate::protocol::{self, Incoming, RemoteTool, RpcError, ToolsPage};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

const MAILBOX_CAPACITY: usize = 64;
const MAX_TOOL_PAGES: usize = 100;

/// What the server told us during the handshake
#[derive(Debug, Clone, Default)]
pub(crate) struct Handshake {
    pub server_info: Value,
    pub tools: Vec<RemoteTool>,
}

pub(crate) struct Session {
    server: String,
    outgoing: mpsc::Sender<Value>,
    pending: Pending,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    closed: CancellationToken,
    child: Mutex<Option<Child>>,
}

enum Waited {
    Reply(Result<Result<Value, RpcError>, oneshot::error::RecvError>),
    Cancelled,
    TimedOut,
}

impl Session {
    pub fn open(
        server: &str,
        connection: Connection,
        framing: Framing,
        max_in_flight: usize,
        events: broadcast::Sender<ToolEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let frames = FramedRead::new(connection.reader, JsonRpcCodec::new(framing));
        let sink = FramedWrite::new(connection.writer, JsonRpcCodec::new(framing));

        tokio::spawn(read_loop(
            server.to_string(),
            frames,
            pending.clone(),
            tx.clone(),
            events,
            closed.clone(),
        ));
        tokio::spawn(write_loop(server.to_string(), sink, rx, closed.clone()));

        Arc::new(Self {
            server: server.to_string(),
            outgoing: tx,
            pending,
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            closed,
            child: Mutex::new(connection.child),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once either pipe has closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn unavailable(&self, method: &str) -> RagoError {
        RagoError::new(
            ErrorKind::ToolServerUnavailable,
            format!("tool server '{}' connection closed", self.server),
        )
        .at(Component::Tools, method.to_string())
    }

    fn interrupt(&self, id: u64, reason: &str) {
        let note = protocol::notification(protocol::METHOD_CANCELLED, protocol::cancel_params(id, reason));
        if self.outgoing.try_send(note).is_err() {
            debug!(server = %self.server, id, "Could not deliver interrupt");
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> RagoResult<()> {
        self.outgoing
            .send(protocol::notification(method, params))
            .await
            .map_err(|_| self.unavailable(method))
    }

    /// Sends one request and waits for its response
    ///
    /// Time spent waiting for an in-flight slot counts toward `timeout`. On
    /// timeout or cancellation the server is sent an interrupt; a cancelled
    /// request keeps its slot for up to `hard_cancel` so the server can wind
    /// down before the next request is written. A server that never answers
    /// the interrupted request has its session closed.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
        hard_cancel: Duration,
    ) -> RagoResult<Value> {
        let deadline = Instant::now() + timeout;
        let timed_out = || {
            RagoError::new(
                ErrorKind::ToolTimeout,
                format!(
                    "'{}' on server '{}' did not answer within {}ms",
                    method,
                    self.server,
                    timeout.as_millis()
                ),
            )
            .at(Component::Tools, method.to_string())
        };
        let cancelled = || RagoError::cancelled().at(Component::Tools, method.to_string());

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = self.closed.cancelled() => return Err(self.unavailable(method)),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| self.unavailable(method))?
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // the reader marks the session closed before it drains `pending`
        if self.is_closed()
            || self
                .outgoing
                .send(protocol::request(id, method, params))
                .await
                .is_err()
        {
            self.pending.lock().remove(&id);
            return Err(self.unavailable(method));
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            reply = &mut rx => Waited::Reply(reply),
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
        };

        match waited {
            Waited::Reply(Ok(Ok(value))) => Ok(value),
            Waited::Reply(Ok(Err(rpc))) => Err(rpc.into_error(method)),
            Waited::Reply(Err(_)) => Err(self.unavailable(method)),
            Waited::TimedOut => {
                self.pending.lock().remove(&id);
                self.interrupt(id, "timeout");
                Err(timed_out())
            }
            Waited::Cancelled => {
                self.interrupt(id, "cancelled");
                let pending = self.pending.clone();
                let closed = self.closed.clone();
                let server = self.server.clone();
                tokio::spawn(async move {
                    if tokio::time::timeout(hard_cancel, rx).await.is_err() {
                        warn!(server = %server, id, "Server ignored interrupt; closing session");
                        closed.cancel();
                    }
                    pending.lock().remove(&id);
                    drop(permit);
                });
                Err(cancelled())
            }
        }
    }

    /// `initialize`, `notifications/initialized`, then every `tools/list` page
    pub async fn handshake(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RagoResult<Handshake> {
        let server_info = self
            .request(
                protocol::METHOD_INITIALIZE,
                protocol::initialize_params(),
                timeout,
                cancel,
                Duration::ZERO,
            )
            .await?;
        self.notify(protocol::METHOD_INITIALIZED, json!({})).await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page = self
                .request(protocol::METHOD_TOOLS_LIST, params, timeout, cancel, Duration::ZERO)
                .await?;
            let page: ToolsPage = serde_json::from_value(page).map_err(|e| {
                RagoError::internal(format!("bad tools/list reply from '{}': {}", self.server, e))
                    .at(Component::Tools, "handshake")
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(Handshake { server_info, tools })
    }

    /// Best-effort `shutdown` request, then tear down the pipes and the process
    pub async fn close(&self, grace: Duration) {
        if !self.is_closed() {
            let never = CancellationToken::new();
            let _ = self
                .request(protocol::METHOD_SHUTDOWN, json!({}), grace, &never, Duration::ZERO)
                .await;
        }
        self.kill();
    }

    pub fn kill(&self) {
        self.closed.cancel();
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                debug!(server = %self.server, error = %e, "Kill failed; process already gone");
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop(
    server: String,
    mut frames: FramedRead<BoxedReader, JsonRpcCodec>,
    pending: Pending,
    outgoing: mpsc::Sender<Value>,
    events: broadcast::Sender<ToolEvent>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = frames.next() => next,
        };
        let message = match next {
            None => {
                debug!(server = %server, "Server output closed");
                break;
            }
            Some(Err(e)) => {
                warn!(server = %server, error = %e, "Unreadable server output");
                break;
            }
            Some(Ok(Frame::Malformed(text))) => {
                warn!(server = %server, "Ignoring malformed message: {}", text);
                continue;
            }
            Some(Ok(Frame::Message(message))) => message,
        };

        match Incoming::classify(message) {
            Some(Incoming::Response { id, outcome }) => {
                let waiter = pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(server = %server, id, "Dropping late response"),
                }
            }
            Some(Incoming::Notification { method, params }) => match method.as_str() {
                protocol::METHOD_LOG => {
                    let (level, text) = parse_log(&params);
                    trace_server_log(&server, &level, &text);
                    let _ = events.send(ToolEvent::Log {
                        server: server.clone(),
                        level,
                        message: text,
                    });
                }
                protocol::METHOD_PROGRESS => {
                    debug!(server = %server, progress = %params, "Progress");
                    let _ = events.send(ToolEvent::Progress {
                        server: server.clone(),
                        params,
                    });
                }
                other => debug!(server = %server, method = other, "Unhandled notification"),
            },
            Some(Incoming::Request { id, method, .. }) => {
                let reply = if method == protocol::METHOD_PING {
                    protocol::response(id, json!({}))
                } else {
                    protocol::error_response(id, protocol::METHOD_NOT_FOUND, "method not supported by client")
                };
                let _ = outgoing.try_send(reply);
            }
            None => warn!(server = %server, "Ignoring message that is not a JSON-RPC envelope"),
        }
    }
    closed.cancel();
    // dropping the senders fails every waiter
    pending.lock().clear();
}

async fn write_loop(
    server: String,
    mut sink: FramedWrite<BoxedWriter, JsonRpcCodec>,
    mut mailbox: mpsc::Receiver<Value>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = mailbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = sink.send(message).await {
            warn!(server = %server, error = %e, "Write to server failed");
            break;
        }
    }
    closed.cancel();
}
