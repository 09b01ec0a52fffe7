//! Workflow engine
//!
//! Owns the registered definitions, the executor, the scheduler and the map
//! of in-flight executions. Cloning the engine is cheap; clones share state.

use crate::backend::StepBackend;
use crate::config::AgentsConfig;
use crate::events::WorkflowEvent;
use crate::executor::{Executor, Settings};
use crate::loader::{self, Definition};
use crate::plan::{plan, Plan};
use crate::scheduler::{ScheduleInfo, Scheduler};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rago_core::{
    AgentDefinition, CancellationToken, Component, ErrorKind, ExecutionContext, ExecutionTarget,
    RagoError, RagoResult, WorkflowDefinition,
};
use rago_state::StateStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Longest idle sleep of the scheduler loop
const MAX_TICK: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 1024;

struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    plan: Plan,
}

struct EngineInner {
    config: AgentsConfig,
    executor: Executor,
    workflows: RwLock<HashMap<String, Arc<RegisteredWorkflow>>>,
    agents: RwLock<HashMap<String, AgentDefinition>>,
    running: DashMap<String, CancellationToken>,
    scheduler: Scheduler,
    wake: Notify,
    shutdown: CancellationToken,
    scheduled_runs: TaskTracker,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Builds the engine and registers stored, inline and on-disk definitions
    /// (later sources replace earlier ones with the same name).
    pub async fn new(
        config: AgentsConfig,
        backend: Arc<dyn StepBackend>,
        store: Arc<dyn StateStore>,
    ) -> RagoResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = Self {
            inner: Arc::new(EngineInner {
                executor: Executor {
                    backend,
                    store: store.clone(),
                    events,
                    settings: Settings::from(&config),
                },
                scheduler: Scheduler::new(config.scheduling.clone()),
                workflows: RwLock::new(HashMap::new()),
                agents: RwLock::new(HashMap::new()),
                running: DashMap::new(),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                scheduled_runs: TaskTracker::new(),
                ticker: Mutex::new(None),
                config,
            }),
        };

        for workflow in store.list_workflows().await? {
            if let Err(e) = engine.install_workflow(workflow.clone()) {
                warn!(workflow = %workflow.name, "Skipping stored workflow: {}", e);
            }
        }
        for agent in store.list_agents().await? {
            engine.inner.agents.write().insert(agent.name.clone(), agent);
        }

        let inline_workflows = engine.inner.config.workflows.clone();
        let inline_agents = engine.inner.config.agents.clone();
        for workflow in inline_workflows {
            engine.register_workflow(workflow).await?;
        }
        for agent in inline_agents {
            engine.register_agent(agent).await?;
        }

        if let Some(dir) = engine.inner.config.definitions_dir.clone() {
            for definition in loader::load_dir(&dir)? {
                match definition {
                    Definition::Workflow(w) => engine.register_workflow(w).await?,
                    Definition::Agent(a) => engine.register_agent(a).await?,
                }
            }
        }

        info!(
            workflows = engine.inner.workflows.read().len(),
            agents = engine.inner.agents.read().len(),
            backend = store.backend_name(),
            "Workflow engine ready"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &AgentsConfig {
        &self.inner.config
    }

    /// Execution and scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.executor.events.subscribe()
    }

    fn install_workflow(&self, workflow: WorkflowDefinition) -> RagoResult<()> {
        let plan = plan(&workflow)?;
        match &workflow.schedule {
            Some(expression) => self
                .inner
                .scheduler
                .set_schedule(&workflow.name, expression, Utc::now())
                .map_err(|e| {
                    RagoError::new(
                        ErrorKind::InvalidWorkflow,
                        format!("workflow '{}': {}", workflow.name, e.message()),
                    )
                    .at(Component::Agents, "register_workflow")
                })?,
            None => self.inner.scheduler.remove_schedule(&workflow.name),
        }
        self.inner.workflows.write().insert(
            workflow.name.clone(),
            Arc::new(RegisteredWorkflow {
                definition: workflow,
                plan,
            }),
        );
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Validates, plans and stores a workflow definition
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> RagoResult<()> {
        let name = workflow.name.clone();
        self.install_workflow(workflow.clone())?;
        self.inner.executor.store.save_workflow(&workflow).await?;
        info!(workflow = %name, steps = workflow.steps.len(), "Registered workflow");
        Ok(())
    }

    pub async fn unregister_workflow(&self, name: &str) -> RagoResult<bool> {
        let removed = self.inner.workflows.write().remove(name).is_some();
        self.inner.scheduler.remove_schedule(name);
        self.inner.executor.store.delete_workflow(name).await?;
        Ok(removed)
    }

    pub async fn register_agent(&self, agent: AgentDefinition) -> RagoResult<()> {
        agent.validate()?;
        self.inner.executor.store.save_agent(&agent).await?;
        info!(agent = %agent.name, tools = agent.tools.len(), "Registered agent");
        self.inner.agents.write().insert(agent.name.clone(), agent);
        Ok(())
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .inner
            .workflows
            .read()
            .values()
            .map(|w| w.definition.clone())
            .collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        workflows
    }

    pub fn get_workflow(&self, name: &str) -> Option<WorkflowDefinition> {
        self.inner
            .workflows
            .read()
            .get(name)
            .map(|w| w.definition.clone())
    }

    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<AgentDefinition> =
            self.inner.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    fn track(&self, ctx: &ExecutionContext, cancel: &CancellationToken) -> CancellationToken {
        let token = cancel.child_token();
        self.inner.running.insert(ctx.id.clone(), token.clone());
        token
    }

    /// Runs a workflow to a terminal status. Step failures are reported in
    /// the returned context; only lookup and validation problems are errors.
    pub async fn execute_workflow(
        &self,
        name: &str,
        inputs: BTreeMap<String, Value>,
        cancel: &CancellationToken,
    ) -> RagoResult<ExecutionContext> {
        let registered = self.inner.workflows.read().get(name).cloned().ok_or_else(|| {
            RagoError::not_found(format!("workflow '{}' is not registered", name))
                .at(Component::Agents, "execute_workflow")
        })?;

        let mut merged = registered.definition.default_inputs.clone();
        merged.extend(inputs);
        let mut ctx = ExecutionContext::new(ExecutionTarget::Workflow(name.to_string()), merged);
        let token = self.track(&ctx, cancel);

        self.inner
            .executor
            .run_workflow(&registered.definition, &registered.plan, &mut ctx, &token)
            .await;
        self.inner.running.remove(&ctx.id);
        Ok(ctx)
    }

    /// Runs an agent on `task`; the context's outputs carry the final text
    pub async fn execute_agent(
        &self,
        name: &str,
        task: &str,
        cancel: &CancellationToken,
    ) -> RagoResult<ExecutionContext> {
        if task.trim().is_empty() {
            return Err(RagoError::bad_request("agent task must not be empty")
                .at(Component::Agents, "execute_agent"));
        }
        let agents = self.inner.agents.read().clone();
        let agent = agents.get(name).cloned().ok_or_else(|| {
            RagoError::not_found(format!("agent '{}' is not registered", name))
                .at(Component::Agents, "execute_agent")
        })?;

        let mut inputs = BTreeMap::new();
        inputs.insert("task".to_string(), Value::String(task.to_string()));
        let mut ctx = ExecutionContext::new(ExecutionTarget::Agent(name.to_string()), inputs);
        let token = self.track(&ctx, cancel);

        self.inner
            .executor
            .run_agent(&agents, &agent, task, &mut ctx, &token)
            .await;
        self.inner.running.remove(&ctx.id);
        Ok(ctx)
    }

    pub async fn get_execution(&self, id: &str) -> RagoResult<Option<ExecutionContext>> {
        self.inner.executor.store.load_execution(id).await
    }

    pub async fn list_executions(&self) -> RagoResult<Vec<ExecutionContext>> {
        self.inner.executor.store.list_executions().await
    }

    /// Cancels an in-flight execution; false when it is not running here
    pub fn cancel_execution(&self, id: &str) -> bool {
        match self.inner.running.get(id) {
            Some(token) => {
                info!(execution = %id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_executions(&self) -> Vec<String> {
        self.inner.running.iter().map(|e| e.key().clone()).collect()
    }

    /// Drops execution records older than the configured TTL
    pub async fn cleanup(&self) -> RagoResult<usize> {
        let removed = self
            .inner
            .executor
            .store
            .cleanup(self.inner.config.state_ttl())
            .await?;
        if removed > 0 {
            info!("Cleaned up {} execution records", removed);
        }
        Ok(removed)
    }

    pub fn next_run(&self, workflow: &str) -> Option<DateTime<Utc>> {
        self.inner.scheduler.next_run(workflow)
    }

    pub fn schedules(&self) -> Vec<ScheduleInfo> {
        self.inner.scheduler.schedules()
    }

    /// Queues a run of `workflow` through its schedule lane, with its
    /// default inputs, without waiting for it to finish
    pub fn trigger_now(&self, workflow: &str) -> RagoResult<()> {
        if !self.inner.workflows.read().contains_key(workflow) {
            return Err(
                RagoError::not_found(format!("workflow '{}' is not registered", workflow))
                    .at(Component::Agents, "trigger_now"),
            );
        }
        self.enqueue(workflow)
    }

    fn enqueue(&self, workflow: &str) -> RagoResult<()> {
        let admission = match self.inner.scheduler.admit(workflow) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(workflow, "Dropping scheduled run: {}", e);
                self.inner.executor.emit(WorkflowEvent::ScheduleDropped {
                    workflow: workflow.to_string(),
                });
                return Err(e);
            }
        };

        let engine = self.clone();
        let name = workflow.to_string();
        self.inner.scheduled_runs.spawn(async move {
            let shutdown = engine.inner.shutdown.clone();
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return,
                permit = admission.acquire() => permit,
            };
            if permit.is_none() {
                return;
            }
            debug!(workflow = %name, "Scheduled run starting");
            match engine
                .execute_workflow(&name, BTreeMap::new(), &shutdown)
                .await
            {
                Ok(ctx) => info!(
                    workflow = %name,
                    execution = %ctx.id,
                    status = %ctx.status,
                    "Scheduled run finished"
                ),
                Err(e) => error!(workflow = %name, "Scheduled run failed: {}", e),
            }
            drop(permit);
            drop(admission);
        });
        Ok(())
    }

    /// Starts the scheduler loop; calling it again is a no-op
    pub fn start(&self) {
        if !self.inner.config.scheduling.enabled {
            debug!("Scheduling disabled");
            return;
        }
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let engine = self.clone();
        *ticker = Some(tokio::spawn(async move { engine.tick_loop().await }));
        info!("Workflow scheduler started");
    }

    async fn tick_loop(self) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let now = Utc::now();
            for workflow in self.inner.scheduler.take_due(now) {
                info!(workflow = %workflow, "Schedule fired");
                let _ = self.enqueue(&workflow);
            }

            let wait = self
                .inner
                .scheduler
                .next_wakeup()
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(MAX_TICK)
                .min(MAX_TICK);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Workflow scheduler stopped");
    }

    /// Stops the scheduler, cancels in-flight executions and waits for
    /// scheduled runs to wind down
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.running.iter() {
            entry.value().cancel();
        }
        let ticker = self.inner.ticker.lock().take();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }
        self.inner.scheduled_runs.close();
        self.inner.scheduled_runs.wait().await;
        info!("Workflow engine stopped");
    }
}
