//! JSON-RPC 2.0 envelopes and the tool-server method set

use rago_core::{Component, ErrorKind, RagoError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_LOG: &str = "notifications/message";
pub const METHOD_PROGRESS: &str = "notifications/progress";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Maps a server-reported protocol error onto the runtime taxonomy
    pub fn into_error(self, operation: &str) -> RagoError {
        let kind = match self.code {
            METHOD_NOT_FOUND => ErrorKind::NotFound,
            INVALID_PARAMS => ErrorKind::InvalidArguments,
            _ => ErrorKind::Internal,
        };
        RagoError::new(
            kind,
            format!("server error {}: {}", self.code, self.message),
        )
        .at(Component::Tools, operation)
    }
}

/// Inbound message from a server
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Server-initiated request
    Request {
        id: Value,
        method: String,
        params: Value,
    },
}

impl Incoming {
    pub fn classify(message: Value) -> Option<Incoming> {
        let Value::Object(mut obj) = message else {
            return None;
        };
        let method = obj
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let params = obj.remove("params").unwrap_or(Value::Null);
        let id = obj.remove("id");

        match (method, id) {
            (Some(method), Some(id)) if !id.is_null() => Some(Incoming::Request { id, method, params }),
            (Some(method), _) => Some(Incoming::Notification { method, params }),
            (None, Some(id)) => {
                let id = id.as_u64()?;
                let outcome = match obj.remove("error") {
                    Some(err) => Err(serde_json::from_value(err).unwrap_or(RpcError {
                        code: -32603,
                        message: "unparseable error object".into(),
                        data: None,
                    })),
                    None => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };
                Some(Incoming::Response { id, outcome })
            }
            (None, None) => None,
        }
    }
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "method": method, "params": params})
}

pub fn response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": {"code": code, "message": message}})
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "rago", "version": rago_core::VERSION}
    })
}

pub fn cancel_params(id: u64, reason: &str) -> Value {
    json!({"requestId": id, "reason": reason})
}

/// Tool entry from `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Page of a `tools/list` result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}
