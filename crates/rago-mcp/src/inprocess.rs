//! In-process tool servers
//!
//! [`DuplexLauncher`] serves a [`ToolHandler`] over in-memory pipes using the
//! same framing and envelopes a child process would. Useful for embedding
//! built-in tools next to external servers, and for driving the host in tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rago_core::{CancellationToken, RagoResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::{Frame, Framing, JsonRpcCodec};
use crate::config::ServerConfig;
use crate::launcher::{Connection, Launcher};
use crate::protocol::{self, Incoming, RemoteTool};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How a handler answers one `tools/call`
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Successful result; strings are sent as text content, anything else as JSON text
    Result(Value),
    /// Tool-level failure (`isError: true`)
    Error(String),
    /// Protocol error response
    RpcError(i64, String),
    /// Tear down the connection as if the process died
    Crash,
    /// Never answer
    Ignore,
}

#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    fn tools(&self) -> Vec<RemoteTool>;

    async fn call(&self, name: &str, arguments: Value) -> Reply;
}

type CallFn = dyn Fn(&str, Value) -> Reply + Send + Sync;

/// Handler backed by a synchronous closure
pub struct FnToolHandler {
    tools: Vec<RemoteTool>,
    call: Box<CallFn>,
}

impl FnToolHandler {
    pub fn new<F>(tools: Vec<RemoteTool>, call: F) -> Self
    where
        F: Fn(&str, Value) -> Reply + Send + Sync + 'static,
    {
        Self {
            tools,
            call: Box::new(call),
        }
    }
}

#[async_trait]
impl ToolHandler for FnToolHandler {
    fn tools(&self) -> Vec<RemoteTool> {
        self.tools.clone()
    }

    async fn call(&self, name: &str, arguments: Value) -> Reply {
        (self.call)(name, arguments)
    }
}

/// Convenience constructor for a catalog entry
pub fn remote_tool(name: &str, description: &str, input_schema: Value) -> RemoteTool {
    RemoteTool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// Launches in-memory servers; every launch gets a fresh connection
pub struct DuplexLauncher {
    handler: Arc<dyn ToolHandler>,
    launches: AtomicUsize,
    interrupts: Arc<AtomicUsize>,
    dead_on_arrival: AtomicBool,
}

impl DuplexLauncher {
    pub fn new(handler: impl ToolHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            launches: AtomicUsize::new(0),
            interrupts: Arc::new(AtomicUsize::new(0)),
            dead_on_arrival: AtomicBool::new(false),
        }
    }

    /// Servers exit before answering the handshake
    pub fn dead_on_arrival(self) -> Self {
        self.dead_on_arrival.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_dead_on_arrival(&self, dead: bool) {
        self.dead_on_arrival.store(dead, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Cancellation notifications received across all connections
    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for DuplexLauncher {
    async fn launch(&self, config: &ServerConfig) -> RagoResult<Connection> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        if self.dead_on_arrival.load(Ordering::SeqCst) {
            drop(server);
        } else {
            tokio::spawn(serve(
                config.name.clone(),
                server,
                config.framing,
                self.handler.clone(),
                self.interrupts.clone(),
            ));
        }
        let (reader, writer) = tokio::io::split(client);
        Ok(Connection::new(Box::new(reader), Box::new(writer)))
    }
}

fn call_result(reply: Reply) -> Option<Result<Value, (i64, String)>> {
    let text = |value: Value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    match reply {
        Reply::Result(value) => Some(Ok(json!({
            "content": [{"type": "text", "text": text(value)}],
            "isError": false
        }))),
        Reply::Error(message) => Some(Ok(json!({
            "content": [{"type": "text", "text": message}],
            "isError": true
        }))),
        Reply::RpcError(code, message) => Some(Err((code, message))),
        Reply::Crash | Reply::Ignore => None,
    }
}

async fn serve(
    name: String,
    stream: DuplexStream,
    framing: Framing,
    handler: Arc<dyn ToolHandler>,
    interrupts: Arc<AtomicUsize>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, JsonRpcCodec::new(framing));
    let mut sink = FramedWrite::new(write_half, JsonRpcCodec::new(framing));
    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let dead = CancellationToken::new();

    let writer_dead = dead.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = writer_dead.cancelled() => break,
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = dead.cancelled() => break,
            next = frames.next() => next,
        };
        let Some(Ok(Frame::Message(message))) = next else {
            if matches!(next, Some(Ok(Frame::Malformed(_)))) {
                continue;
            }
            break;
        };

        match Incoming::classify(message) {
            Some(Incoming::Request { id, method, params }) => match method.as_str() {
                protocol::METHOD_INITIALIZE => {
                    let _ = tx
                        .send(protocol::response(
                            id,
                            json!({
                                "protocolVersion": protocol::PROTOCOL_VERSION,
                                "serverInfo": {"name": name, "version": rago_core::VERSION},
                                "capabilities": {"tools": {}}
                            }),
                        ))
                        .await;
                }
                protocol::METHOD_TOOLS_LIST => {
                    let _ = tx
                        .send(protocol::response(id, json!({ "tools": handler.tools() })))
                        .await;
                }
                protocol::METHOD_PING => {
                    let _ = tx.send(protocol::response(id, json!({}))).await;
                }
                protocol::METHOD_SHUTDOWN => {
                    let _ = tx.send(protocol::response(id, json!({}))).await;
                    break;
                }
                protocol::METHOD_TOOLS_CALL => {
                    let tool = params
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                    let handler = handler.clone();
                    let tx = tx.clone();
                    let dead = dead.clone();
                    tokio::spawn(async move {
                        let reply = handler.call(&tool, arguments).await;
                        if reply == Reply::Crash {
                            dead.cancel();
                            return;
                        }
                        let message = match call_result(reply) {
                            Some(Ok(result)) => protocol::response(id, result),
                            Some(Err((code, message))) => protocol::error_response(id, code, &message),
                            None => return,
                        };
                        let _ = tx.send(message).await;
                    });
                }
                _ => {
                    let _ = tx
                        .send(protocol::error_response(id, protocol::METHOD_NOT_FOUND, "unknown method"))
                        .await;
                }
            },
            Some(Incoming::Notification { method, .. }) => match method.as_str() {
                protocol::METHOD_INITIALIZED => {
                    let _ = tx
                        .send(protocol::notification(
                            protocol::METHOD_LOG,
                            json!({"level": "info", "data": format!("{} ready", name)}),
                        ))
                        .await;
                }
                protocol::METHOD_CANCELLED => {
                    interrupts.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            },
            _ => {}
        }
    }

    debug!(server = %name, "In-process server exiting");
    dead.cancel();
    let _ = writer.await;
}
