//! Events published by the tool host

use rago_core::ServerState;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    /// `notifications/message` from a server
    Log {
        server: String,
        level: String,
        message: String,
    },
    /// `notifications/progress` from a server
    Progress {
        server: String,
        params: Value,
    },
    /// Arguments passed validation but deserve attention
    Warning {
        tool: String,
        message: String,
    },
    StateChanged {
        server: String,
        from: ServerState,
        to: ServerState,
    },
}

/// Forwards a server log notification to tracing at the level it names
pub(crate) fn trace_server_log(server: &str, level: &str, message: &str) {
    match level {
        "emergency" | "alert" | "critical" | "error" => error!(server, "{}", message),
        "warning" | "warn" => warn!(server, "{}", message),
        "notice" | "info" => info!(server, "{}", message),
        _ => debug!(server, "{}", message),
    }
}

/// Extracts level and text from `notifications/message` params
pub(crate) fn parse_log(params: &Value) -> (String, String) {
    let level = params
        .get("level")
        .and_then(|l| l.as_str())
        .unwrap_or("info")
        .to_string();
    let message = match params.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => params
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
    };
    (level, message)
}
