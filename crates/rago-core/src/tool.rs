//! Tool catalog entries and tool server states

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::model::ToolDefinition;

/// Tool discovered from a tool server during handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Published name, unique across the merged catalog
    pub name: String,
    /// Name the owning server knows the tool by
    #[serde(default)]
    pub remote_name: String,
    pub server_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ToolDescriptor {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Tool server lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Crashed,
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::NotStarted => "not-started",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Crashed => "crashed",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Raw result payload returned by the server
    pub content: Value,
    /// Server reported a tool-level failure
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cached: bool,
}

impl ToolOutput {
    /// Text view of the payload: joined `text` content items when present,
    /// otherwise the JSON rendering
    pub fn text(&self) -> String {
        if let Some(items) = self.content.get("content").and_then(|c| c.as_array()) {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Structured view: parses a single text item as JSON when possible
    pub fn value(&self) -> Value {
        let text = self.text();
        if self.content.get("content").is_some() {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            self.content.clone()
        }
    }
}
