//! Workflow engine configuration (`[agents]` section)

use rago_core::{AgentDefinition, Component, RagoError, RagoResult, WorkflowDefinition};
use rago_state::StateBackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// `[agents.scheduling]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub enabled: bool,
    /// Concurrent runs allowed per scheduled workflow
    pub max_concurrent: usize,
    /// Runs waiting for a slot before new ones are dropped
    pub queue_size: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 3,
            queue_size: 100,
        }
    }
}

/// `[agents]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub enabled: bool,
    /// Steps of one execution running in parallel
    pub max_concurrent: usize,
    pub workflow_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// Upper bound on any agent's iterations
    pub max_steps: u32,
    pub state_backend: StateBackendKind,
    pub state_ttl_secs: u64,
    /// Directory of `*.yaml` / `*.json` workflow definitions loaded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<PathBuf>,
    pub scheduling: SchedulingConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<WorkflowDefinition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentDefinition>,
    /// Time interrupted steps get to wind down before they are dropped.
    /// Set by the host from its hard-cancel timeout.
    #[serde(skip, default = "default_hard_cancel_timeout_secs")]
    pub hard_cancel_timeout_secs: u64,
}

fn default_hard_cancel_timeout_secs() -> u64 {
    5
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
            workflow_timeout_secs: 300,
            step_timeout_secs: 60,
            max_steps: 25,
            state_backend: StateBackendKind::Memory,
            state_ttl_secs: 86_400,
            definitions_dir: None,
            scheduling: SchedulingConfig::default(),
            workflows: Vec::new(),
            agents: Vec::new(),
            hard_cancel_timeout_secs: default_hard_cancel_timeout_secs(),
        }
    }
}

impl AgentsConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs.max(1))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }

    pub fn hard_cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_cancel_timeout_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn validate(&self) -> RagoResult<()> {
        let invalid = |msg: &str| {
            Err(RagoError::config(format!("[agents] {}", msg)).at(Component::Config, "validate"))
        };
        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be at least 1");
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be at least 1");
        }
        if self.scheduling.max_concurrent == 0 {
            return invalid("scheduling.max_concurrent must be at least 1");
        }
        Ok(())
    }
}
