//! State store trait and backend selection

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rago_core::{
    AgentDefinition, Component, ExecutionContext, Message, RagoError, RagoResult,
    WorkflowDefinition,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Storage for definitions, execution records and agent memory.
///
/// Writes are best-effort from the caller's point of view: the engine logs a
/// failed write and keeps going, so the in-flight execution is never failed
/// by its own bookkeeping.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> RagoResult<()>;

    async fn load_workflow(&self, name: &str) -> RagoResult<Option<WorkflowDefinition>>;

    async fn list_workflows(&self) -> RagoResult<Vec<WorkflowDefinition>>;

    /// Returns true when a definition was removed
    async fn delete_workflow(&self, name: &str) -> RagoResult<bool>;

    async fn save_agent(&self, agent: &AgentDefinition) -> RagoResult<()>;

    async fn list_agents(&self) -> RagoResult<Vec<AgentDefinition>>;

    async fn save_execution(&self, execution: &ExecutionContext) -> RagoResult<()>;

    async fn load_execution(&self, id: &str) -> RagoResult<Option<ExecutionContext>>;

    /// Executions ordered by start time, oldest first
    async fn list_executions(&self) -> RagoResult<Vec<ExecutionContext>>;

    async fn delete_execution(&self, id: &str) -> RagoResult<bool>;

    /// Replaces the stored conversation for an agent
    async fn save_memory(&self, agent: &str, messages: &[Message]) -> RagoResult<()>;

    /// Stored conversation for an agent, empty when none exists
    async fn load_memory(&self, agent: &str) -> RagoResult<Vec<Message>>;

    /// Deletes finished or interrupted executions that started more than
    /// `ttl` ago. Returns the number removed.
    async fn cleanup(&self, ttl: Duration) -> RagoResult<usize>;

    fn backend_name(&self) -> &'static str;
}

/// Backend selector from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Memory,
    File,
}

impl std::str::FromStr for StateBackendKind {
    type Err = RagoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StateBackendKind::Memory),
            "file" => Ok(StateBackendKind::File),
            other => Err(RagoError::config(format!("unknown state backend '{}'", other))
                .at(Component::State, "open")),
        }
    }
}

/// Opens the configured backend. The file backend requires a root directory.
pub async fn open_store(
    kind: StateBackendKind,
    root: Option<&Path>,
) -> RagoResult<Arc<dyn StateStore>> {
    match kind {
        StateBackendKind::Memory => Ok(Arc::new(memory::MemoryStateStore::new())),
        StateBackendKind::File => {
            let root = root.ok_or_else(|| {
                RagoError::config("file state backend requires a state directory")
                    .at(Component::State, "open")
            })?;
            Ok(Arc::new(file::FileStateStore::open(root).await?))
        }
    }
}

/// True when an execution is old enough and no longer live
pub(crate) fn is_expired(execution: &ExecutionContext, cutoff: DateTime<Utc>) -> bool {
    (execution.status.is_terminal() || execution.interrupted) && execution.started_at < cutoff
}

pub(crate) fn cutoff(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
