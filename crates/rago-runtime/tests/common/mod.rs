//! Shared doubles for the orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rago_core::{
    CancellationToken, Component, EventSink, GenerationRequest, GenerationResponse, MessageRole,
    ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk, ToolCall, Usage,
};
use rago_llm::Provider;
use rago_mcp::{remote_tool, DuplexLauncher, FnToolHandler, McpConfig, Reply, ServerConfig};
use rago_runtime::{HealthConfig, Rago, RagoConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const NOW: &str = "2026-10-16T12:00:00Z";

#[derive(Debug, Clone)]
pub enum Script {
    Text(&'static str),
    Call(&'static str, Value),
    /// Several calls in one turn
    Calls(Vec<(&'static str, Value)>),
    /// Text and a call in the same turn
    SayThenCall(&'static str, &'static str, Value),
    /// Answers with the content of the last tool message
    EchoTool,
    /// Waits (cancel-aware) before answering
    Sleep(Duration),
    Fail(RagoError),
}

pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Script>>,
    fallback: Script,
    pub requests: Mutex<Vec<GenerationRequest>>,
    probe_ok: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Self::with_fallback(Script::Text("ok"))
    }

    pub fn with_fallback(fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            probe_ok: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, script: Script) {
        self.queue.lock().push_back(script);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn request(&self, index: usize) -> GenerationRequest {
        self.requests.lock()[index].clone()
    }

    fn next(&self, request: &GenerationRequest) -> Script {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn calls_response(&self, calls: Vec<(&'static str, Value)>) -> GenerationResponse {
        let turn = self.calls();
        GenerationResponse {
            tool_calls: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, arguments))| ToolCall {
                    id: format!("call_{}_{}", turn, i),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
            ..Default::default()
        }
    }

    async fn answer(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        match self.next(request) {
            Script::Text(text) => Ok(GenerationResponse::text(text)),
            Script::Call(name, arguments) => Ok(self.calls_response(vec![(name, arguments)])),
            Script::Calls(calls) => Ok(self.calls_response(calls)),
            Script::SayThenCall(text, name, arguments) => {
                let mut response = self.calls_response(vec![(name, arguments)]);
                response.content = text.to_string();
                Ok(response)
            }
            Script::EchoTool => {
                let last = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Tool)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                Ok(GenerationResponse::text(format!("The tool said {}", last)))
            }
            Script::Sleep(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RagoError::cancelled().at(Component::Llm, "generate")),
                    _ = tokio::time::sleep(delay) => Ok(GenerationResponse::text("late")),
                }
            }
            Script::Fail(err) => Err(err),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    fn model(&self) -> &str {
        "test-model"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        self.answer(request, cancel).await
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let response = self.answer(request, cancel).await?;
        for word in response.content.split_inclusive(' ') {
            sink.send(StreamChunk::delta(word)).await?;
        }
        sink.send(StreamChunk::finish(response.tool_calls.clone(), Usage::new(1, 1)))
            .await?;
        Ok(response)
    }

    async fn health_probe(&self, _timeout: Duration) -> RagoResult<()> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RagoError::bad_request("invalid api key").at(Component::Llm, "health_probe"))
        }
    }
}

/// Arguments seen by the in-process tool server, in call order
pub type ToolLog = Arc<Mutex<Vec<(String, Value)>>>;

/// In-process server publishing `now`, `weather` and `fail`, plus
/// `entity_extraction` when asked for
pub fn tool_server(with_extraction: bool, log: ToolLog) -> FnToolHandler {
    let mut tools = vec![
        remote_tool(
            "now",
            "Current time in a timezone",
            json!({
                "type": "object",
                "properties": {"timezone": {"type": "string"}},
                "required": ["timezone"]
            }),
        ),
        remote_tool(
            "weather",
            "Weather for a city",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        ),
        remote_tool("fail", "Always fails", json!({"type": "object"})),
    ];
    if with_extraction {
        tools.push(remote_tool(
            "entity_extraction",
            "Named entities in a text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        ));
    }
    FnToolHandler::new(tools, move |name, args| {
        log.lock().push((name.to_string(), args.clone()));
        match name {
            "now" => Reply::Result(json!(NOW)),
            "weather" => Reply::Result(json!("sunny")),
            "fail" => Reply::Error("boom".to_string()),
            "entity_extraction" => Reply::Result(json!({"people": ["Ada Lovelace"]})),
            other => Reply::RpcError(-32601, format!("no tool {}", other)),
        }
    })
}

/// Defaults with the health ticker off
pub fn base_config() -> RagoConfig {
    RagoConfig {
        health: HealthConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn provider_config() -> ProviderConfig {
    ProviderConfig::new("scripted", ProviderType::Openai, "test-model")
}

pub struct Harness {
    pub rago: Rago,
    pub provider: Arc<ScriptedProvider>,
    pub tool_log: ToolLog,
}

pub async fn harness(provider: Arc<ScriptedProvider>) -> Harness {
    harness_with(base_config(), provider, false).await
}

/// Builds and starts a client; one in-process tool server named `local` is
/// attached whenever the tool pillar is on
pub async fn harness_with(
    mut config: RagoConfig,
    provider: Arc<ScriptedProvider>,
    with_extraction: bool,
) -> Harness {
    let tool_log: ToolLog = Arc::new(Mutex::new(Vec::new()));
    if config.mcp.servers.is_empty() {
        config.mcp = McpConfig {
            enabled: config.mcp.enabled,
            ..McpConfig::default()
        }
        .with_server(ServerConfig::new("local", "local"));
    }
    let launcher = Arc::new(DuplexLauncher::new(tool_server(
        with_extraction,
        tool_log.clone(),
    )));
    let rago = Rago::builder(config)
        .with_provider(provider_config(), provider.clone())
        .with_launcher(launcher)
        .build()
        .await
        .unwrap();
    rago.start().await.unwrap();
    Harness {
        rago,
        provider,
        tool_log,
    }
}
