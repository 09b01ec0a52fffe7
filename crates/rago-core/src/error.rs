//! Structured error model
//!
//! Every failure in the runtime is a [`RagoError`]: a concrete [`ErrorKind`],
//! the [`Component`] and operation that raised it, a human readable message
//! and an optional inner cause. Kinds roll up into a small set of
//! [`ErrorCategory`] values that decide retry behavior and the status a
//! caller sees.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used across all RAGO crates
pub type RagoResult<T> = Result<T, RagoError>;

/// Component that raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Llm,
    Rag,
    Tools,
    Agents,
    State,
    Orchestrator,
    Health,
    Config,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Llm => "llm",
            Component::Rag => "rag",
            Component::Tools => "tools",
            Component::Agents => "agents",
            Component::State => "state",
            Component::Orchestrator => "orchestrator",
            Component::Health => "health",
            Component::Config => "config",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    BadRequest,
    InvalidArguments,
    InputTooLarge,
    Transient,
    NoAvailableProvider,
    BreakerOpen,
    ToolTimeout,
    ToolServerUnavailable,
    ScheduleSaturated,
    Conflict,
    NotFound,
    EmbeddingDimensionMismatch,
    IngestPartial,
    InvalidWorkflow,
    NoExecutionBackend,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::InvalidArguments => "invalid-arguments",
            ErrorKind::InputTooLarge => "input-too-large",
            ErrorKind::Transient => "transient",
            ErrorKind::NoAvailableProvider => "no-available-provider",
            ErrorKind::BreakerOpen => "breaker-open",
            ErrorKind::ToolTimeout => "tool-timeout",
            ErrorKind::ToolServerUnavailable => "tool-server-unavailable",
            ErrorKind::ScheduleSaturated => "schedule-saturated",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::EmbeddingDimensionMismatch => "embedding-dimension-mismatch",
            ErrorKind::IngestPartial => "ingest-partial",
            ErrorKind::InvalidWorkflow => "invalid-workflow",
            ErrorKind::NoExecutionBackend => "no-execution-backend",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Category this kind belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::Config | ErrorKind::NoExecutionBackend => ErrorCategory::Configuration,
            ErrorKind::BadRequest
            | ErrorKind::InvalidArguments
            | ErrorKind::InputTooLarge
            | ErrorKind::InvalidWorkflow => ErrorCategory::Validation,
            ErrorKind::Transient | ErrorKind::ToolTimeout | ErrorKind::IngestPartial => {
                ErrorCategory::Transient
            }
            ErrorKind::NoAvailableProvider
            | ErrorKind::BreakerOpen
            | ErrorKind::ToolServerUnavailable
            | ErrorKind::ScheduleSaturated => ErrorCategory::Capacity,
            ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::EmbeddingDimensionMismatch => {
                ErrorCategory::Data
            }
            ErrorKind::Cancelled => ErrorCategory::Cancelled,
            ErrorKind::Internal => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories, each with a caller-facing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Transient,
    Capacity,
    Data,
    Cancelled,
    Internal,
}

/// Status strings surfaced to callers at the transport boundary
impl ErrorCategory {
    pub fn status(&self, kind: ErrorKind) -> &'static str {
        match self {
            ErrorCategory::Configuration => "unavailable",
            ErrorCategory::Validation => "bad-request",
            ErrorCategory::Transient | ErrorCategory::Capacity => "unavailable",
            ErrorCategory::Data => match kind {
                ErrorKind::NotFound => "not-found",
                _ => "conflict",
            },
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Internal => "internal",
        }
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured runtime error
#[derive(Debug, Clone, Error)]
#[error("{component}.{operation}: {kind}: {message}")]
pub struct RagoError {
    kind: ErrorKind,
    component: Component,
    operation: String,
    message: String,
    #[source]
    source: Option<Cause>,
}

impl RagoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            component: Component::Orchestrator,
            operation: "unspecified".to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Stamp the component and operation that raised this error
    pub fn at(mut self, component: Component, operation: impl Into<String>) -> Self {
        self.component = component;
        self.operation = operation.into();
        self
    }

    /// Attach the inner cause
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message).at(Component::Config, "load")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    pub fn input_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputTooLarge, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Caller-facing status (`bad-request`, `unavailable`, `conflict`, ...)
    pub fn status(&self) -> &'static str {
        self.category().status(self.kind)
    }

    /// Only transient failures are retried, and only by the owning component
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Serializable view for wire responses and persisted execution records
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "status": self.status(),
            "component": self.component,
            "operation": self.operation,
            "message": self.message,
            "cause": self.source.as_ref().map(|s| s.to_string()),
        })
    }
}

impl From<std::io::Error> for RagoError {
    fn from(err: std::io::Error) -> Self {
        RagoError::internal(format!("I/O error: {}", err)).with_source(err)
    }
}

impl From<serde_json::Error> for RagoError {
    fn from(err: serde_json::Error) -> Self {
        RagoError::internal(format!("JSON error: {}", err)).with_source(err)
    }
}
