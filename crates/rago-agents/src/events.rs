//! Execution events published on the engine's broadcast channel

use rago_core::{ExecutionStatus, StepStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Execution started
    Started {
        execution_id: String,
        target: String,
    },

    /// Step began running
    StepStarted {
        execution_id: String,
        step_id: String,
        kind: String,
    },

    /// Step reached a terminal status
    StepFinished {
        execution_id: String,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Agent transferred control
    Handoff {
        execution_id: String,
        from: String,
        to: String,
    },

    /// Scheduled run was dropped because the queue was full
    ScheduleDropped { workflow: String },

    /// Execution reached a terminal status
    Finished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::Started { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepFinished { execution_id, .. }
            | WorkflowEvent::Handoff { execution_id, .. }
            | WorkflowEvent::Finished { execution_id, .. } => Some(execution_id),
            WorkflowEvent::ScheduleDropped { .. } => None,
        }
    }
}
