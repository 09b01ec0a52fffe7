//! High-level request and response shapes for the orchestrator

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::{Metadata, SearchResult};
use crate::error::RagoError;
use crate::model::{Message, Usage};
use crate::workflow::ExecutionContext;

/// How candidate tools are chosen when no allow-list is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSelection {
    /// Offer every callable tool in the catalog
    #[default]
    Catalog,
    /// Offer tools whose name shares a word with the message
    Heuristic,
}

/// Per-request tunables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_threshold: Option<f32>,
    /// Explicit tool allow-list; takes precedence over `tool_selection`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_selection: Option<ToolSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
    /// Overall budget in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Prior conversation, oldest first
    #[serde(default)]
    pub context: Vec<Message>,
    #[serde(default)]
    pub use_rag: bool,
    #[serde(default)]
    pub use_tools: bool,
    #[serde(default)]
    pub parameters: ChatParameters,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_rag(mut self) -> Self {
        self.use_rag = true;
        self
    }

    pub fn with_tools(mut self) -> Self {
        self.use_tools = true;
        self
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.parameters.allowed_tools = Some(tools);
        self
    }
}

/// Tool call made during a chat, with its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub parameters: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Chat response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SearchResult>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// The enriched dialogue sent to the model, final assistant turn included
    #[serde(default)]
    pub context: Vec<Message>,
    #[serde(default)]
    pub usage: Usage,
    pub duration_ms: u64,
    /// Tool-call loop stopped at its cap
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub provider: String,
}

/// Events delivered to a `stream_chat` sink
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Content { delta: String },
    ToolCall { record: ToolCallRecord },
    Done { response: ChatResponse },
    Error { error: Value },
}

impl ChatStreamEvent {
    pub fn error(err: &RagoError) -> Self {
        ChatStreamEvent::Error {
            error: err.to_json(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatStreamEvent::Done { .. } | ChatStreamEvent::Error { .. })
    }
}

/// Document actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentAction {
    Ingest,
    Analyze,
    Summarize,
    Extract,
}

/// Document processing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub action: DocumentAction,
    /// Inline content; may be omitted when `document_id` names an ingested document
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Replace an existing document with the same id on ingest
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub parameters: ChatParameters,
}

impl DocumentRequest {
    pub fn new(action: DocumentAction, content: impl Into<String>) -> Self {
        Self {
            action,
            content: Some(content.into()),
            document_id: None,
            content_type: None,
            metadata: Metadata::new(),
            overwrite: false,
            parameters: ChatParameters::default(),
        }
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }
}

/// Document processing response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Chunks written by an ingest
    #[serde(default)]
    pub chunk_count: usize,
    /// Model or tool output for analyze/summarize/extract
    #[serde(default)]
    pub content: String,
    /// Structured extraction result when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub sources: Vec<SearchResult>,
    #[serde(default)]
    pub usage: Usage,
    pub duration_ms: u64,
}

/// Task request routed to an agent, a workflow or a single generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameters: ChatParameters,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn for_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn for_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }
}

/// Task response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub output: Value,
    /// Execution record when the task ran on the agents pillar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionContext>,
    #[serde(default)]
    pub usage: Usage,
    pub duration_ms: u64,
}
