// RAGO Core - Foundation types and traits for the RAGO runtime
//
// This crate carries the data model shared by the four pillars (generation,
// retrieval, tools, agents) and the orchestrator that composes them, plus the
// single structured error type every component surfaces.

pub mod chat;
pub mod document;
pub mod embedding;
pub mod error;
pub mod health;
pub mod model;
pub mod provider;
pub mod sink;
pub mod tool;
pub mod workflow;

pub use chat::{
    ChatParameters, ChatRequest, ChatResponse, ChatStreamEvent, DocumentAction, DocumentRequest,
    DocumentResponse, TaskRequest, TaskResponse, ToolCallRecord, ToolSelection,
};
pub use document::{chunk_id, Chunk, Document, Metadata, SearchFilter, SearchResult};
pub use embedding::{cosine_similarity, l2_normalize, Embedder};
pub use error::{Component, ErrorCategory, ErrorKind, RagoError, RagoResult};
pub use health::{HealthReport, HealthStatus, Pillar};
pub use model::{
    FinishReason, GenerationRequest, GenerationResponse, Message, MessageRole, StreamChunk,
    ToolCall, ToolDefinition, Usage,
};
pub use provider::{ProviderConfig, ProviderType};
pub use sink::{EventSink, FnSink, VecSink};
pub use tool::{ServerState, ToolDescriptor, ToolOutput};
pub use workflow::{
    AgentDefinition, ExecutionContext, ExecutionStatus, ExecutionTarget, FailurePolicy,
    StepDefinition, StepKind, StepRecord, StepStatus, WorkflowDefinition,
};

/// Request-scoped cancellation handle passed through every downstream call
pub use tokio_util::sync::CancellationToken;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of search results
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Hard cap on search results per query
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Default minimum similarity score for dense search
pub const DEFAULT_SEARCH_THRESHOLD: f32 = 0.7;

/// Name of the reserved tool agents use to transfer control
pub const HANDOFF_TOOL: &str = "handoff";
