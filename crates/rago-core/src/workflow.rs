//! Workflow and agent definitions, plus execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{Component, ErrorKind, RagoError, RagoResult};

/// Declarative DAG of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Five-field cron expression, evaluated in UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Inputs used for scheduled runs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_inputs: BTreeMap<String, Value>,
    /// Overall cap in seconds; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            schedule: None,
            default_inputs: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Structural checks: non-empty name, unique step ids, known references.
    /// Cycle detection happens when the engine plans the DAG.
    pub fn validate(&self) -> RagoResult<()> {
        let invalid = |msg: String| {
            RagoError::new(ErrorKind::InvalidWorkflow, msg).at(Component::Agents, "validate")
        };

        if self.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid(format!("workflow '{}' has no steps", self.name)));
        }
        validate_steps(&self.steps, &self.name).map_err(invalid)
    }
}

fn validate_steps(steps: &[StepDefinition], workflow: &str) -> Result<(), String> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(format!("workflow '{}' has a step without an id", workflow));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(format!("workflow '{}': duplicate step id '{}'", workflow, step.id));
        }
    }
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(format!(
                    "workflow '{}': step '{}' depends on unknown step '{}'",
                    workflow, step.id, dep
                ));
            }
            if dep == &step.id {
                return Err(format!(
                    "workflow '{}': step '{}' depends on itself",
                    workflow, step.id
                ));
            }
        }
        match &step.kind {
            StepKind::Branch { then, otherwise, .. } => {
                for target in then.iter().chain(otherwise.iter()) {
                    if !ids.contains(target.as_str()) {
                        return Err(format!(
                            "workflow '{}': branch '{}' targets unknown step '{}'",
                            workflow, step.id, target
                        ));
                    }
                }
            }
            StepKind::Loop {
                steps: body,
                max_iterations,
                ..
            } => {
                if *max_iterations == 0 {
                    return Err(format!(
                        "workflow '{}': loop '{}' needs max_iterations > 0",
                        workflow, step.id
                    ));
                }
                if body.is_empty() {
                    return Err(format!(
                        "workflow '{}': loop '{}' has an empty body",
                        workflow, step.id
                    ));
                }
                validate_steps(body, workflow)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// What to do when a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Fail,
    Continue,
}

/// One node of the workflow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            timeout_secs: None,
            on_failure: FailurePolicy::Fail,
        }
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self::new(
            id,
            StepKind::Tool {
                tool: tool.into(),
                arguments,
            },
        )
    }

    pub fn generate(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Generate {
                prompt: prompt.into(),
                tools: Vec::new(),
                model: None,
                temperature: None,
                max_tokens: None,
            },
        )
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = FailurePolicy::Continue;
        self
    }
}

/// Step kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepKind {
    /// Tool Host call; string arguments may hold templates
    Tool {
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Provider Registry call, tool-augmented when `tools` is non-empty
    Generate {
        prompt: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
    /// Picks one arm by predicate; steps in the other arm are skipped
    Branch {
        condition: String,
        #[serde(default)]
        then: Vec<String>,
        #[serde(default)]
        otherwise: Vec<String>,
    },
    /// Repeats a sub-DAG until the predicate holds or the cap is reached
    Loop {
        condition: String,
        max_iterations: u32,
        steps: Vec<StepDefinition>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Tool { .. } => "tool",
            StepKind::Generate { .. } => "generate",
            StepKind::Branch { .. } => "branch",
            StepKind::Loop { .. } => "loop",
        }
    }
}

fn default_max_steps() -> u32 {
    25
}

/// Loop-driven reasoner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Agents this one may hand control to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoffs: Vec<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Persist the conversation between executions
    #[serde(default)]
    pub memory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            tools: Vec::new(),
            handoffs: Vec::new(),
            max_steps: default_max_steps(),
            memory: false,
            model: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_handoffs(mut self, targets: Vec<String>) -> Self {
        self.handoffs = targets;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn validate(&self) -> RagoResult<()> {
        if self.name.trim().is_empty() {
            return Err(RagoError::new(ErrorKind::InvalidWorkflow, "agent name must not be empty")
                .at(Component::Agents, "validate"));
        }
        if self.max_steps == 0 {
            return Err(RagoError::new(
                ErrorKind::InvalidWorkflow,
                format!("agent '{}': max_steps must be positive", self.name),
            )
            .at(Component::Agents, "validate"));
        }
        Ok(())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Recorded result of one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..Default::default()
        }
    }
}

/// What an execution runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum ExecutionTarget {
    Workflow(String),
    Agent(String),
}

impl ExecutionTarget {
    pub fn name(&self) -> &str {
        match self {
            ExecutionTarget::Workflow(n) | ExecutionTarget::Agent(n) => n,
        }
    }
}

/// State of one workflow or agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: String,
    pub target: ExecutionTarget,
    pub status: ExecutionStatus,
    /// Step records in definition order (agent executions append per iteration)
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Found non-terminal when the state store was reopened
    #[serde(default)]
    pub interrupted: bool,
}

impl ExecutionContext {
    pub fn new(target: ExecutionTarget, inputs: BTreeMap<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            status: ExecutionStatus::Pending,
            steps: Vec::new(),
            inputs,
            outputs: BTreeMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            interrupted: false,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.step_id == id)
    }

    /// Moves to a terminal status; later calls are ignored
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
        true
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}
