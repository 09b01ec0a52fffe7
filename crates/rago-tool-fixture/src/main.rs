//! Stand-alone stdio tool server
//!
//! Speaks the tool-server protocol on stdin/stdout and logs to stderr. Tools:
//! - now: current UTC time
//! - echo: returns `text`
//! - add: adds `a` and `b`
//! - delay: sleeps `ms` milliseconds (interruptible)
//! - crash: exits the process without answering
//!
//! Run with: cargo run --bin rago-tool-fixture -- --framing line

use clap::{Parser, ValueEnum};
use futures::{SinkExt, StreamExt};
use rago_mcp::codec::Frame;
use rago_mcp::protocol::{self, Incoming};
use rago_mcp::{Framing, JsonRpcCodec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    Line,
    Length,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Line => Framing::Line,
            FramingArg::Length => Framing::Length,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "rago-tool-fixture", version, about = "Stdio tool server for tests")]
struct Args {
    /// Message framing on stdio
    #[arg(long, value_enum, default_value = "line", env = "RAGO_FIXTURE_FRAMING")]
    framing: FramingArg,

    /// Name reported in serverInfo
    #[arg(long, default_value = "rago-tool-fixture")]
    name: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let framing = Framing::from(args.framing);
    info!(framing = ?framing, "Starting {}", args.name);

    let mut frames = FramedRead::new(tokio::io::stdin(), JsonRpcCodec::new(framing));
    let mut sink = FramedWrite::new(tokio::io::stdout(), JsonRpcCodec::new(framing));
    let (tx, mut rx) = mpsc::channel::<Value>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!("stdout closed: {}", e);
                break;
            }
        }
    });

    let mut in_flight: HashMap<u64, AbortHandle> = HashMap::new();

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(Frame::Message(message)) => message,
            Ok(Frame::Malformed(text)) => {
                warn!("Malformed input: {}", text);
                continue;
            }
            Err(e) => {
                warn!("stdin unreadable: {}", e);
                break;
            }
        };
        in_flight.retain(|_, handle| !handle.is_finished());

        match Incoming::classify(message) {
            Some(Incoming::Request { id, method, params }) => {
                debug!(method = %method, "Request");
                match method.as_str() {
                    protocol::METHOD_INITIALIZE => {
                        let client = params.get("clientInfo").cloned().unwrap_or(json!({}));
                        info!("Initialize from {}", client);
                        let _ = tx.send(protocol::response(id, initialize_result(&args.name))).await;
                    }
                    protocol::METHOD_TOOLS_LIST => {
                        let _ = tx.send(protocol::response(id, json!({ "tools": tools() }))).await;
                    }
                    protocol::METHOD_PING => {
                        let _ = tx.send(protocol::response(id, json!({}))).await;
                    }
                    protocol::METHOD_SHUTDOWN => {
                        info!("Shutdown requested");
                        let _ = tx.send(protocol::response(id, json!({}))).await;
                        break;
                    }
                    protocol::METHOD_TOOLS_CALL => {
                        let numeric_id = id.as_u64();
                        let tx = tx.clone();
                        let task = tokio::spawn(async move {
                            let reply = call(&params).await;
                            let _ = tx.send(reply.into_message(id)).await;
                        });
                        if let Some(n) = numeric_id {
                            in_flight.insert(n, task.abort_handle());
                        }
                    }
                    other => {
                        let _ = tx
                            .send(protocol::error_response(
                                id,
                                protocol::METHOD_NOT_FOUND,
                                &format!("Method not found: {}", other),
                            ))
                            .await;
                    }
                }
            }
            Some(Incoming::Notification { method, params }) => match method.as_str() {
                protocol::METHOD_INITIALIZED => {
                    let _ = tx
                        .send(protocol::notification(
                            protocol::METHOD_LOG,
                            json!({"level": "info", "data": format!("{} ready", args.name)}),
                        ))
                        .await;
                }
                protocol::METHOD_CANCELLED => {
                    let request = params.get("requestId").and_then(|r| r.as_u64());
                    if let Some(handle) = request.and_then(|r| in_flight.remove(&r)) {
                        info!(request = ?request, "Interrupting call");
                        handle.abort();
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
    info!("Exiting");
}

fn initialize_result(name: &str) -> Value {
    json!({
        "protocolVersion": protocol::PROTOCOL_VERSION,
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": name, "version": env!("CARGO_PKG_VERSION")}
    })
}

fn tools() -> Value {
    json!([
        {
            "name": "now",
            "description": "Current UTC time in RFC 3339",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "echo",
            "description": "Echo the input text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to echo"}},
                "required": ["text"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "number", "description": "First number"},
                    "b": {"type": "number", "description": "Second number"}
                },
                "required": ["a", "b"]
            }
        },
        {
            "name": "delay",
            "description": "Sleep for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer", "description": "Milliseconds to sleep"}},
                "required": ["ms"]
            }
        },
        {
            "name": "crash",
            "description": "Exit the server immediately",
            "inputSchema": {"type": "object", "properties": {}}
        }
    ])
}

enum Outcome {
    Text(String),
    Failed(String),
    Unknown(String),
}

impl Outcome {
    fn into_message(self, id: Value) -> Value {
        match self {
            Outcome::Text(text) => protocol::response(
                id,
                json!({"content": [{"type": "text", "text": text}], "isError": false}),
            ),
            Outcome::Failed(text) => protocol::response(
                id,
                json!({"content": [{"type": "text", "text": text}], "isError": true}),
            ),
            Outcome::Unknown(name) => protocol::error_response(
                id,
                protocol::METHOD_NOT_FOUND,
                &format!("Tool not found: {}", name),
            ),
        }
    }
}

async fn call(params: &Value) -> Outcome {
    let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or(json!({}));
    debug!(tool = name, args = %args, "Calling tool");

    match name {
        "now" => Outcome::Text(chrono::Utc::now().to_rfc3339()),
        "echo" => match args.get("text").and_then(|t| t.as_str()) {
            Some(text) => Outcome::Text(text.to_string()),
            None => Outcome::Failed("text is required".to_string()),
        },
        "add" => {
            let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
            info!("add: {} + {} = {}", a, b, a + b);
            Outcome::Text(json!({"sum": a + b}).to_string())
        }
        "delay" => {
            let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Outcome::Text(format!("slept {}ms", ms))
        }
        "crash" => {
            warn!("crash requested");
            std::process::exit(1);
        }
        other => Outcome::Unknown(other.to_string()),
    }
}
