//! In-memory state store backed by DashMap

use super::{cutoff, is_expired, StateStore};
use async_trait::async_trait;
use dashmap::DashMap;
use rago_core::{AgentDefinition, ExecutionContext, Message, RagoResult, WorkflowDefinition};
use std::time::Duration;

/// Ephemeral store; contents are lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    workflows: DashMap<String, WorkflowDefinition>,
    agents: DashMap<String, AgentDefinition>,
    executions: DashMap<String, ExecutionContext>,
    memory: DashMap<String, Vec<Message>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> RagoResult<()> {
        self.workflows
            .insert(workflow.name.clone(), workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, name: &str) -> RagoResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.get(name).map(|w| w.value().clone()))
    }

    async fn list_workflows(&self) -> RagoResult<Vec<WorkflowDefinition>> {
        let mut workflows: Vec<_> = self.workflows.iter().map(|w| w.value().clone()).collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn delete_workflow(&self, name: &str) -> RagoResult<bool> {
        Ok(self.workflows.remove(name).is_some())
    }

    async fn save_agent(&self, agent: &AgentDefinition) -> RagoResult<()> {
        self.agents.insert(agent.name.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> RagoResult<Vec<AgentDefinition>> {
        let mut agents: Vec<_> = self.agents.iter().map(|a| a.value().clone()).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn save_execution(&self, execution: &ExecutionContext) -> RagoResult<()> {
        self.executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> RagoResult<Option<ExecutionContext>> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn list_executions(&self) -> RagoResult<Vec<ExecutionContext>> {
        let mut executions: Vec<_> = self.executions.iter().map(|e| e.value().clone()).collect();
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }

    async fn delete_execution(&self, id: &str) -> RagoResult<bool> {
        Ok(self.executions.remove(id).is_some())
    }

    async fn save_memory(&self, agent: &str, messages: &[Message]) -> RagoResult<()> {
        self.memory.insert(agent.to_string(), messages.to_vec());
        Ok(())
    }

    async fn load_memory(&self, agent: &str) -> RagoResult<Vec<Message>> {
        Ok(self
            .memory
            .get(agent)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn cleanup(&self, ttl: Duration) -> RagoResult<usize> {
        let cutoff = cutoff(ttl);
        let before = self.executions.len();
        self.executions.retain(|_, e| !is_expired(e, cutoff));
        Ok(before.saturating_sub(self.executions.len()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
