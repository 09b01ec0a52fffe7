//! Workflow execution
//!
//! Steps launch as soon as every effective dependency is terminal, up to
//! `max_concurrent` at a time. Each finished step is recorded exactly once;
//! on failure, cancellation or timeout the steps still running are
//! interrupted and marked `cancelled` while unstarted steps stay `pending`.

use crate::backend::StepBackend;
use crate::condition::Condition;
use crate::config::AgentsConfig;
use crate::events::WorkflowEvent;
use crate::plan::{plan_steps, Plan};
use crate::template::Scope;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rago_core::{
    CancellationToken, Component, ErrorKind, ExecutionContext, ExecutionStatus, FailurePolicy,
    GenerationRequest, Message, RagoError, RagoResult, StepDefinition, StepKind, StepRecord,
    StepStatus, WorkflowDefinition,
};
use rago_state::StateStore;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tool rounds a `generate` step may run before its text is taken as final
const MAX_GENERATE_TOOL_ROUNDS: usize = 5;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub max_concurrent: usize,
    pub step_timeout: Duration,
    pub workflow_timeout: Duration,
    pub max_steps: u32,
    pub cancel_grace: Duration,
}

impl From<&AgentsConfig> for Settings {
    fn from(config: &AgentsConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            step_timeout: config.step_timeout(),
            workflow_timeout: config.workflow_timeout(),
            max_steps: config.max_steps.max(1),
            cancel_grace: config.hard_cancel_timeout(),
        }
    }
}

pub(crate) struct Executor {
    pub backend: Arc<dyn StepBackend>,
    pub store: Arc<dyn StateStore>,
    pub events: broadcast::Sender<WorkflowEvent>,
    pub settings: Settings,
}

type StepResult = (usize, RagoResult<Value>, Duration);

impl Executor {
    pub(crate) fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    /// Best-effort write; bookkeeping failures never fail the execution
    pub(crate) async fn persist(&self, ctx: &ExecutionContext) {
        if let Err(e) = self.store.save_execution(ctx).await {
            warn!(execution = %ctx.id, "Failed to persist execution state: {}", e);
        }
    }

    /// Time allowed for one step, including every iteration of a loop
    fn step_budget(&self, step: &StepDefinition) -> Duration {
        if let Some(secs) = step.timeout_secs {
            return Duration::from_secs(secs.max(1));
        }
        match &step.kind {
            StepKind::Loop {
                steps,
                max_iterations,
                ..
            } => {
                let body: Duration = steps.iter().map(|s| self.step_budget(s)).sum();
                body.saturating_mul(*max_iterations)
            }
            _ => self.settings.step_timeout,
        }
    }

    /// Sum of step budgets capped by the workflow timeout
    pub(crate) fn workflow_budget(&self, workflow: &WorkflowDefinition) -> Duration {
        let cap = workflow
            .timeout_secs
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or(self.settings.workflow_timeout);
        let total: Duration = workflow.steps.iter().map(|s| self.step_budget(s)).sum();
        total.min(cap)
    }

    pub(crate) async fn run_workflow(
        &self,
        workflow: &WorkflowDefinition,
        plan: &Plan,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) {
        ctx.status = ExecutionStatus::Running;
        ctx.steps = workflow.steps.iter().map(|s| StepRecord::pending(&s.id)).collect();
        self.emit(WorkflowEvent::Started {
            execution_id: ctx.id.clone(),
            target: workflow.name.clone(),
        });
        self.persist(ctx).await;

        let budget = self.workflow_budget(workflow);
        let deadline = Instant::now() + budget;
        info!(
            workflow = %workflow.name,
            execution = %ctx.id,
            steps = workflow.steps.len(),
            budget_secs = budget.as_secs(),
            "Starting workflow execution"
        );

        let index: Vec<usize> = plan
            .order
            .iter()
            .filter_map(|id| workflow.steps.iter().position(|s| &s.id == id))
            .collect();
        let step_cancel = cancel.child_token();
        let mut scope = Scope::new(ctx.inputs.clone());
        let mut running: FuturesUnordered<BoxFuture<'_, StepResult>> = FuturesUnordered::new();
        let mut outcome: Option<(ExecutionStatus, String)> = None;

        loop {
            // Launch everything that is ready, resolving skips as we go
            let mut changed = true;
            while changed {
                changed = false;
                for &i in &index {
                    let step = &workflow.steps[i];
                    if ctx.steps[i].status != StepStatus::Pending {
                        continue;
                    }
                    let deps: Vec<StepStatus> = plan
                        .dependencies_of(&step.id)
                        .filter_map(|d| ctx.step(d).map(|r| r.status))
                        .collect();
                    if deps.iter().any(|s| !s.is_terminal()) {
                        continue;
                    }
                    if !deps.is_empty() && deps.iter().all(|s| *s == StepStatus::Skipped) {
                        self.skip(ctx, i, &mut scope);
                        changed = true;
                        continue;
                    }
                    if running.len() >= self.settings.max_concurrent {
                        continue;
                    }

                    let record = &mut ctx.steps[i];
                    record.status = StepStatus::Running;
                    record.started_at = Some(Utc::now());
                    self.emit(WorkflowEvent::StepStarted {
                        execution_id: ctx.id.clone(),
                        step_id: step.id.clone(),
                        kind: step.kind.name().to_string(),
                    });
                    debug!(workflow = %workflow.name, step = %step.id, "Step started");

                    let snapshot = scope.clone();
                    let token = step_cancel.clone();
                    let timeout = self.step_budget(step);
                    running.push(
                        async move {
                            let started = Instant::now();
                            let result = match tokio::time::timeout(
                                timeout,
                                self.execute_step(step, &snapshot, &token),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(RagoError::new(
                                    ErrorKind::Transient,
                                    format!(
                                        "step '{}' timed out after {}s",
                                        step.id,
                                        timeout.as_secs()
                                    ),
                                )
                                .at(Component::Agents, "execute_step")),
                            };
                            (i, result, started.elapsed())
                        }
                        .boxed(),
                    );
                    changed = true;
                }
            }
            self.persist(ctx).await;

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome = Some((ExecutionStatus::Cancelled, "execution cancelled".to_string()));
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    outcome = Some((
                        ExecutionStatus::Failed,
                        format!("workflow '{}' timed out after {}s", workflow.name, budget.as_secs()),
                    ));
                    break;
                }
                Some((i, result, elapsed)) = running.next() => {
                    let step = &workflow.steps[i];
                    match result {
                        Ok(output) => {
                            if let StepKind::Branch { then, otherwise, .. } = &step.kind {
                                let taken = output.get("result").and_then(Value::as_bool).unwrap_or(false);
                                let untaken = if taken { otherwise } else { then };
                                let keep: HashSet<&String> =
                                    if taken { then.iter().collect() } else { otherwise.iter().collect() };
                                for target in untaken.iter().filter(|t| !keep.contains(t)) {
                                    if let Some(j) = workflow.steps.iter().position(|s| &s.id == target) {
                                        if ctx.steps[j].status == StepStatus::Pending {
                                            self.skip(ctx, j, &mut scope);
                                        }
                                    }
                                }
                            }
                            scope.record(&step.id, StepStatus::Completed, output.clone());
                            self.finish_step(ctx, i, StepStatus::Completed, Some(output), None, elapsed);
                        }
                        Err(e) => {
                            let cancelled = e.is_cancelled();
                            let status = if cancelled { StepStatus::Cancelled } else { StepStatus::Failed };
                            warn!(workflow = %workflow.name, step = %step.id, "Step failed: {}", e);
                            scope.record(&step.id, status, Value::Null);
                            self.finish_step(ctx, i, status, None, Some(e.message().to_string()), elapsed);

                            if cancelled {
                                outcome = Some((ExecutionStatus::Cancelled, "execution cancelled".to_string()));
                                break;
                            }
                            if step.on_failure == FailurePolicy::Fail {
                                outcome = Some((
                                    ExecutionStatus::Failed,
                                    format!("step '{}' failed: {}", step.id, e.message()),
                                ));
                                break;
                            }
                        }
                    }
                }
            }
        }

        if outcome.is_some() && !running.is_empty() {
            step_cancel.cancel();
            let drain = async { while running.next().await.is_some() {} };
            if tokio::time::timeout(self.settings.cancel_grace, drain).await.is_err() {
                warn!(workflow = %workflow.name, "Interrupted steps did not wind down in time");
            }
        }
        drop(running);

        let now = Utc::now();
        for record in ctx.steps.iter_mut() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Cancelled;
                record.ended_at = Some(now);
                if let Some(started) = record.started_at {
                    record.duration_ms = (now - started).num_milliseconds().max(0) as u64;
                }
            }
        }

        for (record, step) in ctx.steps.iter().zip(workflow.steps.iter()) {
            if record.status == StepStatus::Completed {
                if let Some(output) = &record.output {
                    ctx.outputs.insert(step.id.clone(), output.clone());
                }
            }
        }

        let (status, error) = match outcome {
            Some((status, message)) => (status, Some(message)),
            None => (ExecutionStatus::Completed, None),
        };
        ctx.finish(status, error);
        info!(
            workflow = %workflow.name,
            execution = %ctx.id,
            status = %ctx.status,
            "Workflow execution finished"
        );
        self.emit(WorkflowEvent::Finished {
            execution_id: ctx.id.clone(),
            status: ctx.status,
        });
        self.persist(ctx).await;
    }

    fn skip(&self, ctx: &mut ExecutionContext, i: usize, scope: &mut Scope) {
        let now = Utc::now();
        let record = &mut ctx.steps[i];
        record.status = StepStatus::Skipped;
        record.started_at = Some(now);
        record.ended_at = Some(now);
        scope.record(&record.step_id, StepStatus::Skipped, Value::Null);
        debug!(step = %record.step_id, "Step skipped");
        let event = WorkflowEvent::StepFinished {
            execution_id: ctx.id.clone(),
            step_id: ctx.steps[i].step_id.clone(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            error: None,
        };
        self.emit(event);
    }

    fn finish_step(
        &self,
        ctx: &mut ExecutionContext,
        i: usize,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
        elapsed: Duration,
    ) {
        let record = &mut ctx.steps[i];
        if record.status.is_terminal() {
            return;
        }
        record.status = status;
        record.output = output;
        record.error = error.clone();
        record.duration_ms = elapsed.as_millis() as u64;
        record.ended_at = Some(Utc::now());
        let event = WorkflowEvent::StepFinished {
            execution_id: ctx.id.clone(),
            step_id: record.step_id.clone(),
            status,
            duration_ms: record.duration_ms,
            error,
        };
        self.emit(event);
    }

    /// Runs one step against a snapshot of the scope
    fn execute_step<'a>(
        &'a self,
        step: &'a StepDefinition,
        scope: &'a Scope,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RagoResult<Value>> {
        async move {
            if cancel.is_cancelled() {
                return Err(RagoError::cancelled().at(Component::Agents, "execute_step"));
            }
            match &step.kind {
                StepKind::Tool { tool, arguments } => {
                    let arguments = match scope.render(arguments) {
                        Value::Null => json!({}),
                        other => other,
                    };
                    let output = self
                        .backend
                        .call_tool(tool, arguments, Some(self.step_budget(step)), cancel)
                        .await?;
                    if output.is_error {
                        return Err(RagoError::internal(format!(
                            "tool '{}' reported an error: {}",
                            tool,
                            output.text()
                        ))
                        .at(Component::Agents, "execute_step"));
                    }
                    Ok(output.value())
                }
                StepKind::Generate {
                    prompt,
                    tools,
                    model,
                    temperature,
                    max_tokens,
                } => {
                    let mut template = GenerationRequest::from_prompt(scope.render_str(prompt))
                        .with_timeout(self.step_budget(step));
                    template.model = model.clone();
                    template.temperature = *temperature;
                    template.max_tokens = *max_tokens;
                    self.generate_with_tools(template, tools, cancel)
                        .await
                        .map(Value::String)
                }
                StepKind::Branch { condition, .. } => {
                    let result = Condition::parse(condition)?.evaluate(scope);
                    debug!(step = %step.id, result, "Branch evaluated");
                    Ok(json!({
                        "result": result,
                        "taken": if result { "then" } else { "otherwise" },
                    }))
                }
                StepKind::Loop {
                    condition,
                    max_iterations,
                    steps,
                } => {
                    self.run_loop(step, condition, *max_iterations, steps, scope, cancel)
                        .await
                }
            }
        }
        .boxed()
    }

    /// Generation with a bounded tool loop; returns the final text
    async fn generate_with_tools(
        &self,
        mut request: GenerationRequest,
        tools: &[String],
        cancel: &CancellationToken,
    ) -> RagoResult<String> {
        if !tools.is_empty() {
            request.tools = self.backend.tool_definitions(tools).await;
        }
        let timeout = request.timeout;
        for round in 0..=MAX_GENERATE_TOOL_ROUNDS {
            let response = self.backend.generate(request.clone(), cancel).await?;
            let last_round = round == MAX_GENERATE_TOOL_ROUNDS;
            if !response.has_tool_calls() || request.tools.is_empty() || last_round {
                return Ok(response.content);
            }
            request.messages.push(Message::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let text = match self
                    .backend
                    .call_tool(&call.name, call.arguments.clone(), timeout, cancel)
                    .await
                {
                    Ok(output) => output.text(),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => format!("error: {}", e.message()),
                };
                request.messages.push(Message::tool(call.id, text));
            }
        }
        Ok(String::new())
    }

    async fn run_loop(
        &self,
        step: &StepDefinition,
        condition: &str,
        max_iterations: u32,
        body: &[StepDefinition],
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> RagoResult<Value> {
        let condition = Condition::parse(condition)?;
        let plan = plan_steps(&step.id, body)?;
        let mut scope = scope.clone();
        let mut iterations = Vec::new();
        let mut satisfied = false;

        for iteration in 0..max_iterations {
            scope.set_iteration(iteration);
            let mut results = Map::new();
            let mut skipped: HashSet<String> = HashSet::new();

            for id in &plan.order {
                let Some(inner) = body.iter().find(|s| &s.id == id) else {
                    continue;
                };
                let deps: Vec<&String> = plan.dependencies_of(id).collect();
                let all_deps_skipped = !deps.is_empty() && deps.iter().all(|d| skipped.contains(*d));
                if skipped.contains(id) || all_deps_skipped {
                    skipped.insert(id.clone());
                    scope.record(id, StepStatus::Skipped, Value::Null);
                    continue;
                }

                let result = match tokio::time::timeout(
                    self.step_budget(inner),
                    self.execute_step(inner, &scope, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RagoError::new(
                        ErrorKind::Transient,
                        format!("step '{}' timed out", inner.id),
                    )
                    .at(Component::Agents, "execute_step")),
                };

                match result {
                    Ok(output) => {
                        if let StepKind::Branch { then, otherwise, .. } = &inner.kind {
                            let taken = output.get("result").and_then(Value::as_bool).unwrap_or(false);
                            let (keep, untaken) = if taken { (then, otherwise) } else { (otherwise, then) };
                            skipped.extend(untaken.iter().filter(|t| !keep.contains(t)).cloned());
                        }
                        scope.record(id, StepStatus::Completed, output.clone());
                        results.insert(id.clone(), output);
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) if inner.on_failure == FailurePolicy::Continue => {
                        scope.record(id, StepStatus::Failed, Value::Null);
                        results.insert(id.clone(), json!({"error": e.message()}));
                    }
                    Err(e) => {
                        return Err(RagoError::new(
                            e.kind(),
                            format!(
                                "loop '{}' iteration {}: step '{}' failed: {}",
                                step.id,
                                iteration,
                                id,
                                e.message()
                            ),
                        )
                        .at(Component::Agents, "execute_step"));
                    }
                }
            }

            iterations.push(Value::Object(results));
            if condition.evaluate(&scope) {
                satisfied = true;
                break;
            }
        }

        debug!(step = %step.id, iterations = iterations.len(), satisfied, "Loop finished");
        Ok(json!({
            "iterations": iterations.len(),
            "satisfied": satisfied,
            "results": iterations,
        }))
    }
}
