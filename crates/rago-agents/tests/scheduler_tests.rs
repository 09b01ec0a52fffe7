//! Scheduler Integration Tests

mod common;

use chrono::Utc;
use common::{engine, engine_with, ScriptedBackend};
use rago_agents::{AgentsConfig, SchedulingConfig, WorkflowEvent};
use rago_core::{ErrorKind, ExecutionStatus, StepDefinition, WorkflowDefinition};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn single(name: &str, tool: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(name, vec![StepDefinition::tool("only", tool, json!({}))])
}

// ============================================================================
// Schedules
// ============================================================================

#[tokio::test]
async fn test_scheduled_workflow_reports_next_run() {
    let engine = engine(Arc::new(ScriptedBackend::new())).await;
    engine
        .register_workflow(single("report", "echo").with_schedule("*/5 * * * *"))
        .await
        .unwrap();
    engine
        .register_workflow(single("manual", "echo"))
        .await
        .unwrap();

    let next = engine.next_run("report").unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + chrono::Duration::minutes(5));
    assert!(engine.next_run("manual").is_none());

    let schedules = engine.schedules();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].workflow, "report");
    assert_eq!(schedules[0].expression, "*/5 * * * *");
}

#[tokio::test]
async fn test_invalid_schedule_rejected() {
    let engine = engine(Arc::new(ScriptedBackend::new())).await;
    let err = engine
        .register_workflow(single("bad", "echo").with_schedule("61 * * * *"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidWorkflow);
    assert!(engine.get_workflow("bad").is_none());
}

#[tokio::test]
async fn test_reregistering_without_schedule_removes_it() {
    let engine = engine(Arc::new(ScriptedBackend::new())).await;
    engine
        .register_workflow(single("report", "echo").with_schedule("0 * * * *"))
        .await
        .unwrap();
    engine
        .register_workflow(single("report", "echo"))
        .await
        .unwrap();
    assert!(engine.schedules().is_empty());
}

// ============================================================================
// Manual triggers and saturation
// ============================================================================

#[tokio::test]
async fn test_trigger_now_runs_in_background() {
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine(backend.clone()).await;
    engine
        .register_workflow(single("report", "echo"))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    engine.trigger_now("report").unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(WorkflowEvent::Finished { status, .. }) = events.recv().await {
                break status;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(backend.tool_names(), vec!["echo"]);

    let err = engine.trigger_now("missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_excess_runs_are_dropped() {
    let config = AgentsConfig {
        scheduling: SchedulingConfig {
            enabled: true,
            max_concurrent: 1,
            queue_size: 1,
        },
        ..Default::default()
    };
    let engine = engine_with(Arc::new(ScriptedBackend::new()), config).await;
    engine
        .register_workflow(single("busy", "slow"))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    engine.trigger_now("busy").unwrap();
    engine.trigger_now("busy").unwrap();
    let err = engine.trigger_now("busy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScheduleSaturated);

    let dropped = loop {
        if let WorkflowEvent::ScheduleDropped { workflow } = events.recv().await.unwrap() {
            break workflow;
        }
    };
    assert_eq!(dropped, "busy");

    // Shutdown cancels the running execution and releases the queued one
    engine.shutdown().await;
    assert!(engine.running_executions().is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_is_idempotent_and_shutdown_stops() {
    let engine = engine(Arc::new(ScriptedBackend::new())).await;
    engine
        .register_workflow(single("report", "echo").with_schedule("0 3 * * *"))
        .await
        .unwrap();
    engine.start();
    engine.start();

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disabled_scheduling_still_allows_triggers() {
    let config = AgentsConfig {
        scheduling: SchedulingConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine_with(backend.clone(), config).await;
    engine
        .register_workflow(single("report", "echo"))
        .await
        .unwrap();
    engine.start();

    let mut events = engine.subscribe();
    engine.trigger_now("report").unwrap();
    loop {
        if let WorkflowEvent::Finished { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    engine.shutdown().await;
    assert_eq!(backend.tool_names(), vec!["echo"]);
}
