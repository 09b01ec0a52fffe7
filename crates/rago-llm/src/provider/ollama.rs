//! Local inference server backend (`/api/chat`, NDJSON streaming)

use async_trait::async_trait;
use rago_core::{
    CancellationToken, Component, EventSink, FinishReason, GenerationRequest, GenerationResponse,
    Message, ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk, ToolCall, Usage,
};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use super::http::{self, BodyLines};
use super::Provider;

pub struct OllamaProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> RagoResult<Self> {
        let client = http::build_client(config.timeout())?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint().trim_end_matches('/'), path)
    }

    pub(crate) fn build_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "messages": messages,
            "stream": stream,
        });

        let mut options = Map::new();
        if let Some(t) = request.temperature.or(self.config.temperature) {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(max) = request.max_tokens.or(self.config.max_tokens) {
            options.insert("num_predict".into(), json!(max));
        }
        if !request.stop.is_empty() {
            options.insert("stop".into(), json!(request.stop));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
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
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
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
            .map(|c| json!({"function": {"name": c.name, "arguments": c.arguments}}))
            .collect();
        obj.insert("tool_calls".into(), Value::Array(calls));
    }
    Value::Object(obj)
}

/// Tool calls in one NDJSON frame or full reply; the server assigns no ids
fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
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
        .unwrap_or_default()
}

fn parse_usage(frame: &Value) -> Option<Usage> {
    let prompt = frame.get("prompt_eval_count").and_then(|v| v.as_u64());
    let completion = frame.get("eval_count").and_then(|v| v.as_u64());
    match (prompt, completion) {
        (None, None) => None,
        (p, c) => Some(Usage::new(p.unwrap_or(0) as u32, c.unwrap_or(0) as u32)),
    }
}

fn parse_finish_reason(frame: &Value, has_calls: bool) -> FinishReason {
    if has_calls {
        return FinishReason::ToolCalls;
    }
    match frame.get("done_reason").and_then(|v| v.as_str()) {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn check_frame_error(frame: &Value, operation: &str) -> RagoResult<()> {
    match frame.get("error").and_then(|e| e.as_str()) {
        Some(message) => Err(RagoError::transient(format!("backend error: {}", message))
            .at(Component::Llm, operation)),
        None => Ok(()),
    }
}

pub(crate) fn parse_reply(frame: &Value) -> RagoResult<GenerationResponse> {
    check_frame_error(frame, "generate")?;
    let message = frame.get("message").cloned().unwrap_or(Value::Null);
    let tool_calls = parse_tool_calls(&message);
    Ok(GenerationResponse {
        content: message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        usage: parse_usage(frame).unwrap_or_default(),
        model: frame
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        provider: String::new(),
        finish_reason: parse_finish_reason(frame, !tool_calls.is_empty()),
        tool_calls,
    })
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Ollama
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
        let builder = self
            .client
            .post(self.url("api/chat"))
            .timeout(http::effective_timeout(self.config.timeout(), request.timeout))
            .json(&body);
        let frame = http::send_json(builder, cancel, "generate").await?;
        let mut response = parse_reply(&frame)?;
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
        let builder = self
            .client
            .post(self.url("api/chat"))
            .timeout(http::effective_timeout(self.config.timeout(), request.timeout))
            .json(&body);
        let response = http::send(builder, cancel, "stream").await?;

        let mut lines = BodyLines::new(response);
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut last_frame = Value::Null;

        while let Some(line) = lines.next(cancel, "stream").await? {
            let frame: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    debug!(provider = %self.config.name, "Skipping malformed NDJSON line: {}", e);
                    continue;
                }
            };
            check_frame_error(&frame, "stream")?;

            if let Some(message) = frame.get("message") {
                if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
                    if !text.is_empty() {
                        content.push_str(text);
                        sink.send(StreamChunk::delta(text)).await?;
                    }
                }
                tool_calls.extend(parse_tool_calls(message));
            }

            let done = frame.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
            if done {
                usage = parse_usage(&frame);
                last_frame = frame;
                break;
            }
        }

        let usage = usage.unwrap_or_else(|| {
            Usage::new(
                request.approximate_prompt_tokens(),
                Usage::approximate_tokens(content.chars().count()),
            )
        });
        sink.send(StreamChunk::finish(tool_calls.clone(), usage)).await?;

        Ok(GenerationResponse {
            finish_reason: parse_finish_reason(&last_frame, !tool_calls.is_empty()),
            content,
            tool_calls,
            usage,
            model: self.config.model.clone(),
            provider: String::new(),
        })
    }

    async fn health_probe(&self, timeout: Duration) -> RagoResult<()> {
        let builder = self.client.get(self.url("api/tags")).timeout(timeout);
        http::send(builder, &CancellationToken::new(), "health_probe")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_core::ToolDefinition;

    fn provider() -> OllamaProvider {
        OllamaProvider::new(ProviderConfig::new("local", ProviderType::Ollama, "llama3.2")).unwrap()
    }

    #[test]
    fn test_build_body_maps_options() {
        let req = GenerationRequest::from_prompt("hi")
            .with_temperature(0.1)
            .with_max_tokens(64)
            .with_tools(vec![ToolDefinition {
                name: "now".into(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            }]);
        let body = provider().build_body(&req, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["tools"][0]["function"]["name"], "now");
    }

    #[test]
    fn test_parse_reply_with_object_arguments() {
        let frame = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "now", "arguments": {"timezone": "UTC"}}}]
            },
            "done": true,
            "prompt_eval_count": 20,
            "eval_count": 4
        });
        let resp = parse_reply(&frame).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["timezone"], "UTC");
        assert!(resp.tool_calls[0].id.starts_with("call_"));
        assert_eq!(resp.usage.total_tokens, 24);
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_frame_error_is_transient() {
        let err = parse_reply(&json!({"error": "model not loaded"})).unwrap_err();
        assert!(err.is_retryable());
    }
}
