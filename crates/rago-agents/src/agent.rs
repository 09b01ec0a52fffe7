//! Agent loop
//!
//! Each iteration is one tool-augmented generation. Tool calls are executed
//! and their results appended to the conversation until the model answers
//! with text only or the iteration cap is reached. A call to the reserved
//! handoff tool switches the active agent; the new agent continues from the
//! same conversation under its own instructions and tools.

use crate::events::WorkflowEvent;
use crate::executor::Executor;
use chrono::Utc;
use rago_core::{
    AgentDefinition, CancellationToken, Component, ExecutionContext, ExecutionStatus,
    GenerationRequest, Message, MessageRole, RagoError, RagoResult, StepRecord, StepStatus,
    ToolDefinition, HANDOFF_TOOL,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Result of a finished agent run
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AgentOutcome {
    pub content: String,
    /// Agent holding control when the run ended
    pub agent: String,
    pub iterations: u32,
    pub max_steps_reached: bool,
}

impl AgentOutcome {
    fn into_outputs(self, ctx: &mut ExecutionContext) {
        ctx.outputs.insert("content".into(), Value::String(self.content));
        ctx.outputs.insert("agent".into(), Value::String(self.agent));
        ctx.outputs.insert("iterations".into(), json!(self.iterations));
        ctx.outputs
            .insert("max_steps_reached".into(), json!(self.max_steps_reached));
    }
}

fn handoff_definition(targets: &[String]) -> ToolDefinition {
    ToolDefinition {
        name: HANDOFF_TOOL.to_string(),
        description: "Transfer the conversation to another agent".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent": {"type": "string", "enum": targets},
                "reason": {"type": "string"}
            },
            "required": ["agent"]
        }),
    }
}

impl Executor {
    pub(crate) async fn run_agent(
        &self,
        agents: &HashMap<String, AgentDefinition>,
        start: &AgentDefinition,
        task: &str,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) {
        ctx.status = ExecutionStatus::Running;
        self.emit(WorkflowEvent::Started {
            execution_id: ctx.id.clone(),
            target: start.name.clone(),
        });
        self.persist(ctx).await;
        info!(agent = %start.name, execution = %ctx.id, "Starting agent execution");

        match self.agent_loop(agents, start, task, ctx, cancel).await {
            Ok(outcome) => {
                outcome.into_outputs(ctx);
                ctx.finish(ExecutionStatus::Completed, None);
            }
            Err(e) if e.is_cancelled() => {
                ctx.finish(ExecutionStatus::Cancelled, Some("execution cancelled".to_string()));
            }
            Err(e) => {
                warn!(agent = %start.name, "Agent execution failed: {}", e);
                ctx.finish(ExecutionStatus::Failed, Some(e.message().to_string()));
            }
        }

        info!(
            agent = %start.name,
            execution = %ctx.id,
            status = %ctx.status,
            "Agent execution finished"
        );
        self.emit(WorkflowEvent::Finished {
            execution_id: ctx.id.clone(),
            status: ctx.status,
        });
        self.persist(ctx).await;
    }

    async fn agent_loop(
        &self,
        agents: &HashMap<String, AgentDefinition>,
        start: &AgentDefinition,
        task: &str,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> RagoResult<AgentOutcome> {
        let mut current = start.clone();
        let mut messages = vec![Message::system(&current.instructions)];
        if start.memory {
            match self.store.load_memory(&start.name).await {
                Ok(history) => messages.extend(history),
                Err(e) => warn!(agent = %start.name, "Failed to load agent memory: {}", e),
            }
        }
        messages.push(Message::user(task));

        let mut iterations = 0u32;
        let mut last_text = String::new();
        let outcome = loop {
            let cap = current.max_steps.min(self.settings.max_steps);
            if iterations >= cap {
                debug!(agent = %current.name, iterations, "Agent reached max_steps");
                break AgentOutcome {
                    content: last_text.clone(),
                    agent: current.name.clone(),
                    iterations,
                    max_steps_reached: true,
                };
            }
            if cancel.is_cancelled() {
                return Err(RagoError::cancelled().at(Component::Agents, "execute_agent"));
            }
            iterations += 1;

            let step_id = format!("{}#{}", current.name, iterations);
            let started = tokio::time::Instant::now();
            ctx.steps.push(StepRecord {
                step_id: step_id.clone(),
                status: StepStatus::Running,
                started_at: Some(Utc::now()),
                ..Default::default()
            });

            let mut tools = self.backend.tool_definitions(&current.tools).await;
            if !current.handoffs.is_empty() {
                tools.push(handoff_definition(&current.handoffs));
            }
            let mut request = GenerationRequest::new(messages.clone())
                .with_tools(tools)
                .with_timeout(self.settings.step_timeout);
            request.model = current.model.clone();
            request.temperature = current.temperature;

            let response = match self.backend.generate(request, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    let status = if e.is_cancelled() {
                        StepStatus::Cancelled
                    } else {
                        StepStatus::Failed
                    };
                    close_step(ctx, status, None, Some(e.message().to_string()), started);
                    return Err(e);
                }
            };
            last_text = response.content.clone();

            if !response.has_tool_calls() {
                close_step(
                    ctx,
                    StepStatus::Completed,
                    Some(json!({"content": response.content})),
                    None,
                    started,
                );
                break AgentOutcome {
                    content: response.content,
                    agent: current.name.clone(),
                    iterations,
                    max_steps_reached: false,
                };
            }

            messages.push(Message::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            let mut handoff_to: Option<AgentDefinition> = None;
            let mut called = Vec::new();

            for call in &response.tool_calls {
                called.push(call.name.clone());
                if handoff_to.is_some() {
                    messages.push(Message::tool(&call.id, "skipped: control was handed off"));
                    continue;
                }
                if call.name == HANDOFF_TOOL {
                    let target = call
                        .arguments
                        .get("agent")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    match agents.get(target) {
                        Some(next) if current.handoffs.iter().any(|h| h == target) => {
                            info!(from = %current.name, to = %target, "Agent handoff");
                            self.emit(WorkflowEvent::Handoff {
                                execution_id: ctx.id.clone(),
                                from: current.name.clone(),
                                to: target.to_string(),
                            });
                            messages.push(Message::tool(
                                &call.id,
                                format!("handed off to {}", target),
                            ));
                            handoff_to = Some(next.clone());
                        }
                        _ => {
                            messages.push(Message::tool(
                                &call.id,
                                format!("error: '{}' is not a handoff target", target),
                            ));
                        }
                    }
                    continue;
                }

                let text = match self
                    .backend
                    .call_tool(&call.name, call.arguments.clone(), None, cancel)
                    .await
                {
                    Ok(output) if output.is_error => format!("error: {}", output.text()),
                    Ok(output) => output.text(),
                    Err(e) if e.is_cancelled() => {
                        close_step(ctx, StepStatus::Cancelled, None, None, started);
                        return Err(e);
                    }
                    Err(e) => format!("error: {}", e.message()),
                };
                messages.push(Message::tool(&call.id, text));
            }

            close_step(
                ctx,
                StepStatus::Completed,
                Some(json!({"content": response.content, "tool_calls": called})),
                None,
                started,
            );

            if let Some(next) = handoff_to {
                if let Some(system) = messages.first_mut() {
                    if system.role == MessageRole::System {
                        *system = Message::system(&next.instructions);
                    }
                }
                current = next;
            }
            self.persist(ctx).await;
        };

        if start.memory {
            let history: Vec<Message> = messages
                .into_iter()
                .skip(1)
                .chain(std::iter::once(Message::assistant(&outcome.content)))
                .collect();
            if let Err(e) = self.store.save_memory(&start.name, &history).await {
                warn!(agent = %start.name, "Failed to save agent memory: {}", e);
            }
        }
        Ok(outcome)
    }
}

fn close_step(
    ctx: &mut ExecutionContext,
    status: StepStatus,
    output: Option<Value>,
    error: Option<String>,
    started: tokio::time::Instant,
) {
    if let Some(record) = ctx.steps.last_mut() {
        record.status = status;
        record.output = output;
        record.error = error;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.ended_at = Some(Utc::now());
    }
}
