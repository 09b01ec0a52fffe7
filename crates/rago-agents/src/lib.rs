// RAGO Agents - Workflow engine
//
// Declarative workflows run as DAGs of tool, generate, branch and loop steps
// with bounded parallelism. Agents are loop-driven reasoners that call tools
// until they answer, optionally handing control to one another. Workflows
// with a cron schedule are fired by an in-process scheduler. Generation and
// tool calls go through the `StepBackend` the orchestrator provides.

mod agent;
pub mod backend;
pub mod condition;
pub mod config;
pub mod cron;
pub mod engine;
pub mod events;
mod executor;
pub mod loader;
pub mod plan;
pub mod scheduler;
pub mod template;

pub use backend::StepBackend;
pub use condition::Condition;
pub use config::{AgentsConfig, SchedulingConfig};
pub use cron::CronSchedule;
pub use engine::WorkflowEngine;
pub use events::WorkflowEvent;
pub use loader::{load_dir, load_file, parse_definition, Definition};
pub use plan::{plan, Plan};
pub use scheduler::ScheduleInfo;
pub use template::Scope;
