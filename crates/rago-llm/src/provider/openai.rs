//! Chat-completions backend (OpenAI and compatible local servers)

use async_trait::async_trait;
use rago_core::{
    CancellationToken, Component, EventSink, FinishReason, GenerationRequest, GenerationResponse,
    Message, MessageRole, ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk,
    ToolCall, Usage,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::http::{self, BodyLines};
use super::Provider;

pub struct OpenAiProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> RagoResult<Self> {
        if config.provider_type == ProviderType::Openai && config.api_key.is_none() {
            debug!(provider = %config.name, "No api_key configured; requests go out unauthenticated");
        }
        let client = http::build_client(config.timeout())?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint().trim_end_matches('/'), path)
    }

    fn request(&self, path: &str, body: &Value, budget: Option<Duration>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.url(path))
            .timeout(http::effective_timeout(self.config.timeout(), budget))
            .json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    pub(crate) fn build_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "messages": messages,
            "stream": stream,
        });

        if let Some(t) = request.temperature.or(self.config.temperature) {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        if !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": if t.parameters.is_null() {
                                json!({"type": "object", "properties": {}})
                            } else {
                                t.parameters.clone()
                            },
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

fn encode_message(message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("role".into(), json!(message.role.as_str()));
    obj.insert("content".into(), json!(message.content));
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    }
                })
            })
            .collect();
        obj.insert("tool_calls".into(), Value::Array(calls));
    }
    if message.role == MessageRole::Tool {
        if let Some(id) = &message.tool_call_id {
            obj.insert("tool_call_id".into(), json!(id));
        }
    }
    Value::Object(obj)
}

fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn parse_finish_reason(raw: Option<&str>, has_calls: bool) -> FinishReason {
    match raw {
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        _ if has_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

/// Decodes a non-streaming chat-completions body
pub(crate) fn parse_completion(body: &Value) -> RagoResult<GenerationResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| {
            RagoError::transient("response has no choices").at(Component::Llm, "generate")
        })?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, call)| ToolCall {
                    id: call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{}", i)),
                    name: call
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: http::parse_arguments(
                        call.pointer("/function/arguments").unwrap_or(&Value::Null),
                    ),
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = parse_finish_reason(
        choice.get("finish_reason").and_then(|v| v.as_str()),
        !tool_calls.is_empty(),
    );

    Ok(GenerationResponse {
        usage: parse_usage(body).unwrap_or_default(),
        model: body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        content,
        tool_calls,
        provider: String::new(),
        finish_reason,
    })
}

/// Accumulates streamed tool-call fragments by index
#[derive(Default)]
pub(crate) struct ToolCallAccumulator {
    calls: BTreeMap<u64, (String, String, String)>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(|v| v.as_str()) {
            entry.0 = id.to_string();
        }
        if let Some(name) = delta.pointer("/function/name").and_then(|v| v.as_str()) {
            entry.1.push_str(name);
        }
        if let Some(args) = delta.pointer("/function/arguments").and_then(|v| v.as_str()) {
            entry.2.push_str(args);
        }
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, (id, name, args))| ToolCall {
                id: if id.is_empty() {
                    format!("call_{}", index)
                } else {
                    id
                },
                name,
                arguments: http::parse_arguments(&Value::String(args)),
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        self.config.provider_type
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let body = self.build_body(request, false);
        let builder = self.request("chat/completions", &body, request.timeout);
        let value = http::send_json(builder, cancel, "generate").await?;
        let mut response = parse_completion(&value)?;
        if response.usage.total_tokens == 0 {
            response.usage = Usage::new(
                request.approximate_prompt_tokens(),
                Usage::approximate_tokens(response.content.chars().count()),
            );
        }
        if response.model.is_empty() {
            response.model = self.config.model.clone();
        }
        Ok(response)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let body = self.build_body(request, true);
        let builder = self.request("chat/completions", &body, request.timeout);
        let response = http::send(builder, cancel, "stream").await?;

        let mut lines = BodyLines::new(response);
        let mut content = String::new();
        let mut calls = ToolCallAccumulator::default();
        let mut usage = None;
        let mut finish = None;
        let mut model = String::new();

        while let Some(line) = lines.next(cancel, "stream").await? {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break;
            }
            let event: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    debug!(provider = %self.config.name, "Skipping malformed SSE event: {}", e);
                    continue;
                }
            };
            if let Some(u) = parse_usage(&event) {
                usage = Some(u);
            }
            if model.is_empty() {
                if let Some(m) = event.get("model").and_then(|m| m.as_str()) {
                    model = m.to_string();
                }
            }
            let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else {
                continue;
            };
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                finish = Some(reason.to_string());
            }
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                if !text.is_empty() {
                    content.push_str(text);
                    sink.send(StreamChunk::delta(text)).await?;
                }
            }
            if let Some(fragments) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for fragment in fragments {
                    calls.push(fragment);
                }
            }
        }

        let tool_calls = calls.finish();
        let usage = usage.unwrap_or_else(|| {
            Usage::new(
                request.approximate_prompt_tokens(),
                Usage::approximate_tokens(content.chars().count()),
            )
        });
        sink.send(StreamChunk::finish(tool_calls.clone(), usage)).await?;

        Ok(GenerationResponse {
            finish_reason: parse_finish_reason(finish.as_deref(), !tool_calls.is_empty()),
            content,
            tool_calls,
            usage,
            model: if model.is_empty() {
                self.config.model.clone()
            } else {
                model
            },
            provider: String::new(),
        })
    }

    async fn health_probe(&self, timeout: Duration) -> RagoResult<()> {
        let mut builder = self.client.get(self.url("models")).timeout(timeout);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        http::send(builder, &CancellationToken::new(), "health_probe")
            .await
            .map(|_| ())
    }
}
