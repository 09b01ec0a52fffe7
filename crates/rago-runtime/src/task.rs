//! `execute_task`

use rago_core::{
    CancellationToken, Component, ErrorKind, GenerationRequest, RagoError, RagoResult,
    TaskRequest, TaskResponse,
};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::client::Rago;

impl Rago {
    /// Routes a task to an agent, a workflow, or a single model call
    ///
    /// Agent and workflow routes need the agents pillar; without it the task
    /// falls through to the model. A failed execution is still a response;
    /// its record carries the status and error.
    pub async fn execute_task(
        &self,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<TaskResponse> {
        let timeout = request.parameters.timeout_secs.map(Duration::from_secs);
        self.scoped(cancel, timeout, |token| async move {
            let started = Instant::now();
            let mut response = self.route_task(request, &token).await?;
            response.duration_ms = started.elapsed().as_millis() as u64;
            Ok(response)
        })
        .await
    }

    async fn route_task(
        &self,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<TaskResponse> {
        let agents = self.pillars.agents.as_ref();

        if let (Some(agents), Some(agent)) = (agents, request.agent.as_deref()) {
            debug!(agent, "Routing task to agent");
            let execution = agents.execute_agent(agent, &request.task, cancel).await?;
            return Ok(TaskResponse {
                output: Value::Object(execution.outputs.clone().into_iter().collect()),
                execution: Some(execution),
                ..Default::default()
            });
        }

        if let (Some(agents), Some(workflow)) = (agents, request.workflow.as_deref()) {
            debug!(workflow, "Routing task to workflow");
            let mut inputs = request.inputs;
            if !request.task.trim().is_empty() {
                inputs
                    .entry("task".to_string())
                    .or_insert_with(|| Value::String(request.task.clone()));
            }
            let execution = agents.execute_workflow(workflow, inputs, cancel).await?;
            return Ok(TaskResponse {
                output: Value::Object(execution.outputs.clone().into_iter().collect()),
                execution: Some(execution),
                ..Default::default()
            });
        }

        if let Some(llm) = self.pillars.llm.as_ref() {
            if request.task.trim().is_empty() {
                return Err(RagoError::bad_request("task must not be empty")
                    .at(Component::Orchestrator, "execute_task"));
            }
            let mut generation = GenerationRequest::from_prompt(request.task.as_str());
            if let Some(model) = &request.parameters.model {
                generation = generation.with_model(model.clone());
            }
            if let Some(temperature) = request.parameters.temperature {
                generation = generation.with_temperature(temperature);
            }
            if let Some(max_tokens) = request.parameters.max_tokens {
                generation = generation.with_max_tokens(max_tokens);
            }
            let response = llm.generate(&generation, cancel).await?;
            return Ok(TaskResponse {
                output: Value::String(response.content),
                usage: response.usage,
                ..Default::default()
            });
        }

        Err(RagoError::new(
            ErrorKind::NoExecutionBackend,
            "no agent, workflow or generation backend can run this task",
        )
        .at(Component::Orchestrator, "execute_task"))
    }
}
