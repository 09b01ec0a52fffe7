//! Shared test doubles for the workflow engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rago_agents::{AgentsConfig, StepBackend, WorkflowEngine};
use rago_core::{
    CancellationToken, Component, GenerationRequest, GenerationResponse, RagoError, RagoResult,
    ToolCall, ToolDefinition, ToolOutput,
};
use rago_state::{MemoryStateStore, StateStore};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Backend with queued model replies and a handful of canned tools:
///
/// - `echo` returns its arguments
/// - `sleep` waits `tool_delay` (cancel-aware) and returns its arguments
/// - `slow` waits ten seconds
/// - `stubborn` waits thirty seconds and ignores cancellation
/// - `fail` returns an error
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<GenerationResponse>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub tool_calls: Mutex<Vec<(String, Value)>>,
    tool_delay: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool_delay(mut self, delay: Duration) -> Self {
        self.tool_delay = delay;
        self
    }

    pub fn reply_text(&self, text: &str) {
        self.replies.lock().push_back(GenerationResponse::text(text));
    }

    pub fn reply_tool_call(&self, name: &str, arguments: Value) {
        let id = format!("call_{}", self.replies.lock().len() + 1);
        self.replies.lock().push_back(GenerationResponse {
            tool_calls: vec![ToolCall {
                id,
                name: name.to_string(),
                arguments,
            }],
            ..Default::default()
        });
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tool_calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

async fn wait(delay: Duration, cancel: &CancellationToken) -> RagoResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RagoError::cancelled().at(Component::Tools, "call")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl StepBackend for ScriptedBackend {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        if cancel.is_cancelled() {
            return Err(RagoError::cancelled().at(Component::Llm, "generate"));
        }
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        Ok(reply.unwrap_or_else(|| GenerationResponse::text("ok")))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RagoResult<ToolOutput> {
        self.tool_calls
            .lock()
            .push((name.to_string(), arguments.clone()));
        match name {
            "sleep" => wait(self.tool_delay, cancel).await?,
            "slow" => wait(Duration::from_secs(10), cancel).await?,
            "stubborn" => tokio::time::sleep(Duration::from_secs(30)).await,
            "fail" => {
                return Err(RagoError::internal("tool exploded").at(Component::Tools, "call"))
            }
            _ => {}
        }
        Ok(ToolOutput {
            content: arguments,
            is_error: false,
            duration_ms: 0,
            cached: false,
        })
    }

    async fn tool_definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("test tool {}", name),
                parameters: json!({"type": "object"}),
            })
            .collect()
    }
}

pub async fn engine(backend: Arc<ScriptedBackend>) -> WorkflowEngine {
    engine_with(backend, AgentsConfig::default()).await
}

pub async fn engine_with(backend: Arc<ScriptedBackend>, config: AgentsConfig) -> WorkflowEngine {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    WorkflowEngine::new(config, backend, store).await.unwrap()
}
