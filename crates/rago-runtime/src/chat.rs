//! `chat` and `stream_chat`
//!
//! One request runs as: retrieval (optional) → tool selection (optional) →
//! a generate / tool-call loop bounded by `max_tool_calls`. Tool errors are
//! fed back to the model as tool messages; only cancellation aborts the loop.

use async_trait::async_trait;
use rago_core::{
    CancellationToken, ChatParameters, ChatRequest, ChatResponse, ChatStreamEvent, Component,
    EventSink, GenerationRequest, GenerationResponse, Message, RagoError, RagoResult,
    SearchResult, StreamChunk, ToolCall, ToolCallRecord, ToolDefinition, ToolDescriptor,
    ToolSelection, Usage,
};
use rago_rag::SearchQuery;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::Rago;

const SKIPPED_LIMIT: &str = "skipped: tool call limit reached";

/// Forwards text deltas of a provider stream as chat events. When tools
/// are offered the deltas are held back until the turn is known to be the
/// final answer. Nothing is forwarded once the request is cancelled.
struct ForwardSink<'a, 'b> {
    out: &'a mut (dyn EventSink<ChatStreamEvent> + 'b),
    cancel: &'a CancellationToken,
    held: Option<Vec<String>>,
}

impl<'a, 'b> ForwardSink<'a, 'b> {
    fn new(
        out: &'a mut (dyn EventSink<ChatStreamEvent> + 'b),
        cancel: &'a CancellationToken,
        hold: bool,
    ) -> Self {
        Self {
            out,
            cancel,
            held: hold.then(Vec::new),
        }
    }

    fn check_cancel(&self) -> RagoResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RagoError::cancelled().at(Component::Orchestrator, "stream_chat"));
        }
        Ok(())
    }

    /// Delivers held deltas; a turn that ended in tool calls drops them
    async fn finish(mut self, answered: bool) -> RagoResult<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        if !answered {
            return Ok(());
        }
        for delta in held {
            self.check_cancel()?;
            self.out.send(ChatStreamEvent::Content { delta }).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink<StreamChunk> for ForwardSink<'_, '_> {
    async fn send(&mut self, chunk: StreamChunk) -> RagoResult<()> {
        self.check_cancel()?;
        if chunk.content.is_empty() {
            return Ok(());
        }
        match self.held.as_mut() {
            Some(held) => {
                held.push(chunk.content);
                Ok(())
            }
            None => {
                self.out
                    .send(ChatStreamEvent::Content {
                        delta: chunk.content,
                    })
                    .await
            }
        }
    }
}

fn context_message(result: &SearchResult) -> Message {
    Message::system(format!(
        "Context from document '{}' (relevance {:.2}):\n{}",
        result.document_id, result.score, result.content
    ))
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
}

/// Tools whose name shares a word with the message
fn heuristic_tools(message: &str, catalog: Vec<ToolDescriptor>) -> Vec<ToolDescriptor> {
    let message: HashSet<String> = words(message).collect();
    catalog
        .into_iter()
        .filter(|tool| words(&tool.name).any(|w| message.contains(&w)))
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl Rago {
    /// Answers one chat request
    pub async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<ChatResponse> {
        let timeout = request.parameters.timeout_secs.map(Duration::from_secs);
        self.scoped(cancel, timeout, |token| async move {
            self.run_chat(request, None, &token).await
        })
        .await
    }

    /// Like [`Rago::chat`], delivering text deltas and tool calls to `sink`
    /// as they happen. Text of a turn that ends in tool calls is not
    /// delivered. The last event is either `done` or `error`; after
    /// cancellation nothing more is delivered.
    pub async fn stream_chat(
        &self,
        request: ChatRequest,
        sink: &mut dyn EventSink<ChatStreamEvent>,
        cancel: &CancellationToken,
    ) -> RagoResult<ChatResponse> {
        let timeout = request.parameters.timeout_secs.map(Duration::from_secs);
        let inner: &mut dyn EventSink<ChatStreamEvent> = &mut *sink;
        let result = self
            .scoped(cancel, timeout, |token| async move {
                self.run_chat(request, Some(inner), &token).await
            })
            .await;

        match result {
            Ok(response) => {
                sink.send(ChatStreamEvent::Done {
                    response: response.clone(),
                })
                .await?;
                Ok(response)
            }
            Err(e) => {
                if !e.is_cancelled() && !cancel.is_cancelled() {
                    if let Err(send_err) = sink.send(ChatStreamEvent::error(&e)).await {
                        debug!(error = %send_err, "Could not deliver stream error");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_chat(
        &self,
        request: ChatRequest,
        mut sink: Option<&mut dyn EventSink<ChatStreamEvent>>,
        cancel: &CancellationToken,
    ) -> RagoResult<ChatResponse> {
        let operation = if sink.is_some() { "stream_chat" } else { "chat" };
        let started = Instant::now();
        if request.message.trim().is_empty() {
            return Err(RagoError::bad_request("message must not be empty")
                .at(Component::Orchestrator, operation));
        }
        let llm = self.llm_pillar(operation)?;
        let params = &request.parameters;
        let budget = params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.orchestrator.request_timeout());
        let deadline = started + budget;

        let sources = if request.use_rag {
            self.retrieve(&request.message, params, operation, cancel)
                .await?
        } else {
            Vec::new()
        };
        let tools = if request.use_tools {
            self.select_tools(&request, operation)?
        } else {
            Vec::new()
        };

        let mut messages = request.context.clone();
        messages.extend(sources.iter().map(context_message));
        messages.push(Message::user(request.message.as_str()));

        let max_calls = params
            .max_tool_calls
            .unwrap_or(self.config.orchestrator.max_tool_calls);
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut usage = Usage::default();
        let mut provider = String::new();
        let mut truncated = false;

        let content = loop {
            if cancel.is_cancelled() {
                return Err(RagoError::cancelled().at(Component::Orchestrator, operation));
            }
            // Once the budget is spent the model only gets to answer
            let exhausted = records.len() >= max_calls;
            let offered = if exhausted { Vec::new() } else { tools.clone() };
            let generation = generation_request(messages.clone(), offered, params, deadline);

            let response: GenerationResponse = match sink.as_deref_mut() {
                Some(out) if generation.tools.is_empty() => {
                    let mut forward = ForwardSink::new(out, cancel, false);
                    llm.stream(&generation, &mut forward, cancel).await?
                }
                Some(out) => {
                    let mut forward = ForwardSink::new(out, cancel, true);
                    let response = llm
                        .stream_with_tools(&generation, &mut forward, cancel)
                        .await?;
                    forward.finish(!response.has_tool_calls()).await?;
                    response
                }
                None if generation.tools.is_empty() => llm.generate(&generation, cancel).await?,
                None => llm.generate_with_tools(&generation, cancel).await?,
            };
            usage.add(&response.usage);
            provider = response.provider.clone();

            if !response.has_tool_calls() || generation.tools.is_empty() {
                truncated |= exhausted && response.has_tool_calls();
                break response.content;
            }

            messages.push(Message::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                if records.len() >= max_calls {
                    truncated = true;
                    messages.push(Message::tool(call.id, SKIPPED_LIMIT));
                    continue;
                }
                let (record, reply) = self
                    .invoke_tool(call, &generation.tools, deadline, operation, cancel)
                    .await?;
                if let Some(out) = sink.as_deref_mut() {
                    if cancel.is_cancelled() {
                        return Err(RagoError::cancelled().at(Component::Orchestrator, operation));
                    }
                    out.send(ChatStreamEvent::ToolCall {
                        record: record.clone(),
                    })
                    .await?;
                }
                messages.push(Message::tool(record.id.clone(), reply));
                records.push(record);
            }
        };

        messages.push(Message::assistant(content.as_str()));
        debug!(
            provider = %provider,
            sources = sources.len(),
            tool_calls = records.len(),
            truncated,
            "Chat completed"
        );
        Ok(ChatResponse {
            content,
            sources,
            tool_calls: records,
            context: messages,
            usage,
            duration_ms: elapsed_ms(started),
            truncated,
            provider,
        })
    }

    async fn retrieve(
        &self,
        text: &str,
        params: &ChatParameters,
        operation: &str,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let rag = self.rag_pillar(operation)?;
        let limit = params.rag_limit.unwrap_or(self.config.orchestrator.rag_limit);
        let threshold = params
            .rag_threshold
            .unwrap_or(self.config.orchestrator.rag_threshold);
        let query = SearchQuery::new(text).limit(limit).threshold(threshold);
        rag.search(&query, cancel).await
    }

    /// Tools offered to the model. An explicit allow-list wins; otherwise the
    /// whole catalog, or the heuristic subset when asked for.
    fn select_tools(
        &self,
        request: &ChatRequest,
        operation: &str,
    ) -> RagoResult<Vec<ToolDefinition>> {
        let host = self.tools_pillar(operation)?;
        let params = &request.parameters;
        let selected: Vec<ToolDescriptor> = match &params.allowed_tools {
            Some(allowed) => {
                let mut seen = HashSet::new();
                allowed
                    .iter()
                    .filter_map(|name| {
                        let tool = host.get_tool(name);
                        if tool.is_none() {
                            warn!(tool = %name, "Allowed tool is not in the catalog");
                        }
                        tool
                    })
                    .filter(|tool| tool.enabled && seen.insert(tool.name.clone()))
                    .collect()
            }
            None => {
                let catalog: Vec<ToolDescriptor> =
                    host.list_tools().into_iter().filter(|t| t.enabled).collect();
                match params
                    .tool_selection
                    .unwrap_or(self.config.orchestrator.tool_selection)
                {
                    ToolSelection::Catalog => catalog,
                    ToolSelection::Heuristic => heuristic_tools(&request.message, catalog),
                }
            }
        };
        Ok(selected.iter().map(ToolDescriptor::definition).collect())
    }

    /// Runs one model-requested call; the reply is the tool message content
    async fn invoke_tool(
        &self,
        call: ToolCall,
        offered: &[ToolDefinition],
        deadline: Instant,
        operation: &str,
        cancel: &CancellationToken,
    ) -> RagoResult<(ToolCallRecord, String)> {
        let mut record = ToolCallRecord {
            id: call.id,
            name: call.name,
            parameters: call.arguments,
            result: Value::Null,
            error: None,
            duration_ms: 0,
        };
        if !offered.iter().any(|t| t.name == record.name) {
            let message = format!("tool '{}' is not available for this request", record.name);
            record.error = Some(message.clone());
            return Ok((record, format!("error: {}", message)));
        }

        let host = self.tools_pillar(operation)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = remaining.min(host.config().call_timeout());
        let started = Instant::now();
        let result = host
            .call_tool(&record.name, record.parameters.clone(), Some(timeout), cancel)
            .await;
        record.duration_ms = elapsed_ms(started);

        let reply = match result {
            Ok(output) => {
                let text = output.text();
                record.result = output.value();
                if output.is_error {
                    record.error = Some(text.clone());
                    format!("error: {}", text)
                } else {
                    text
                }
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(tool = %record.name, error = %e, "Tool call failed");
                record.error = Some(e.message().to_string());
                format!("error: {}", e.message())
            }
        };
        Ok((record, reply))
    }
}

fn generation_request(
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    params: &ChatParameters,
    deadline: Instant,
) -> GenerationRequest {
    let mut request = GenerationRequest::new(messages).with_tools(tools);
    if let Some(model) = &params.model {
        request = request.with_model(model.clone());
    }
    if let Some(temperature) = params.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = params.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    request.with_timeout(remaining.max(Duration::from_millis(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            remote_name: name.to_string(),
            server_name: "srv".to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            enabled: true,
        }
    }

    #[test]
    fn test_heuristic_matches_name_words() {
        let catalog = vec![tool("get_weather"), tool("search_docs"), tool("now")];
        let picked = heuristic_tools("What's the weather in Paris right now?", catalog);
        let names: Vec<&str> = picked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get_weather", "now"]);
    }

    #[test]
    fn test_context_message_carries_score() {
        let result = SearchResult {
            chunk_id: "d1#0".into(),
            document_id: "d1".into(),
            content: "Paris".into(),
            score: 0.8123,
            vector_score: Some(0.8123),
            keyword_score: None,
            metadata: Default::default(),
        };
        let message = context_message(&result);
        assert!(message.content.contains("relevance 0.81"));
        assert!(message.content.ends_with("Paris"));
    }
}
