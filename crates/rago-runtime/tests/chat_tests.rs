//! Chat Orchestration Integration Tests

mod common;

use common::{base_config, harness, harness_with, Script, ScriptedProvider, NOW};
use rago_core::{
    CancellationToken, ChatRequest, ChatStreamEvent, Document, ErrorKind, MessageRole, RagoError,
    ToolSelection, VecSink,
};
use rago_runtime::RunMode;
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Plain chat
// ============================================================================

#[tokio::test]
async fn test_plain_chat_returns_model_answer() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Text("Hello there"));
    let h = harness(provider).await;

    let response = h
        .rago
        .chat(ChatRequest::new("Hi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.content, "Hello there");
    assert_eq!(response.provider, "scripted");
    assert!(response.sources.is_empty());
    assert!(response.tool_calls.is_empty());
    assert!(!response.truncated);

    let roles: Vec<MessageRole> = response.context.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);

    let sent = h.provider.request(0);
    assert!(sent.tools.is_empty());
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_prior_context_is_kept_in_order() {
    let h = harness(ScriptedProvider::new()).await;
    let history = vec![
        rago_core::Message::user("My name is Ada"),
        rago_core::Message::assistant("Nice to meet you, Ada"),
    ];

    h.rago
        .chat(
            ChatRequest::new("What is my name?").with_context(history),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let sent = h.provider.request(0);
    assert_eq!(sent.messages.len(), 3);
    assert_eq!(sent.messages[0].content, "My name is Ada");
    assert_eq!(sent.messages[2].content, "What is my name?");
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let h = harness(ScriptedProvider::new()).await;

    let err = h
        .rago
        .chat(ChatRequest::new("   "), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(h.provider.calls(), 0);
    h.rago.shutdown().await;
}

// ============================================================================
// Retrieval
// ============================================================================

#[tokio::test]
async fn test_rag_chat_adds_relevant_context() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Text("Paris"));
    let h = harness(provider).await;
    let cancel = CancellationToken::new();

    for (id, text) in [
        ("france", "The capital of France is Paris."),
        ("rust", "Rust is a systems programming language."),
        ("berlin", "The weather in Berlin is cold in winter."),
    ] {
        h.rago
            .ingest(Document::new(id, text), false, &cancel)
            .await
            .unwrap();
    }

    let response = h
        .rago
        .chat(
            ChatRequest::new("Which city is the capital of France?").with_rag(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(response.content, "Paris");
    assert_eq!(response.sources.len(), 1);
    assert_eq!(response.sources[0].document_id, "france");
    assert!(response.sources[0].score >= 0.7);

    let sent = h.provider.request(0);
    assert_eq!(sent.messages[0].role, MessageRole::System);
    assert!(sent.messages[0]
        .content
        .starts_with("Context from document 'france'"));
    assert!(sent.messages[0].content.contains("Paris"));
    assert_eq!(sent.messages.last().unwrap().role, MessageRole::User);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_rag_without_matches_still_answers() {
    let h = harness(ScriptedProvider::new()).await;

    let response = h
        .rago
        .chat(
            ChatRequest::new("Anything about volcanoes?").with_rag(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(response.sources.is_empty());
    assert_eq!(h.provider.request(0).messages.len(), 1);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_rag_request_without_retrieval_pillar_is_rejected() {
    let mut config = base_config();
    config.mode = RunMode::LlmOnly;
    let h = harness_with(config, ScriptedProvider::new(), false).await;

    let err = h
        .rago
        .chat(ChatRequest::new("Hi").with_rag(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = h
        .rago
        .chat(ChatRequest::new("Hi").with_tools(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    h.rago.shutdown().await;
}

// ============================================================================
// Tool loop
// ============================================================================

#[tokio::test]
async fn test_tool_call_result_reaches_the_model() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Call("now", json!({"timezone": "UTC"})));
    provider.push(Script::EchoTool);
    let h = harness(provider).await;

    let response = h
        .rago
        .chat(
            ChatRequest::new("What time is it in UTC?").with_tools(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.content, format!("The tool said {}", NOW));
    assert_eq!(response.tool_calls.len(), 1);
    let record = &response.tool_calls[0];
    assert_eq!(record.name, "now");
    assert_eq!(record.parameters, json!({"timezone": "UTC"}));
    assert_eq!(record.result, json!(NOW));
    assert!(record.error.is_none());
    assert!(!response.truncated);

    let first = h.provider.request(0);
    let offered: Vec<&str> = first.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(offered, vec!["now", "weather", "fail"]);

    let roles: Vec<MessageRole> = response.context.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );
    assert_eq!(
        h.tool_log.lock().as_slice(),
        &[("now".to_string(), json!({"timezone": "UTC"}))]
    );
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_tool_error_is_fed_back_to_the_model() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Call("fail", json!({})));
    provider.push(Script::EchoTool);
    let h = harness(provider).await;

    let response = h
        .rago
        .chat(ChatRequest::new("Try it").with_tools(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.content, "The tool said error: boom");
    assert_eq!(response.tool_calls[0].error.as_deref(), Some("boom"));
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_call_to_tool_not_offered_is_refused() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Call("weather", json!({"city": "Oslo"})));
    provider.push(Script::EchoTool);
    let h = harness(provider).await;

    let response = h
        .rago
        .chat(
            ChatRequest::new("What time is it?")
                .with_tools()
                .with_allowed_tools(vec!["now".into()]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.content,
        "The tool said error: tool 'weather' is not available for this request"
    );
    assert!(h.tool_log.lock().is_empty());
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_allow_list_wins_over_selection() {
    let h = harness(ScriptedProvider::new()).await;
    let mut request = ChatRequest::new("What's the weather like?")
        .with_tools()
        .with_allowed_tools(vec!["now".into(), "local.now".into(), "missing".into()]);
    request.parameters.tool_selection = Some(ToolSelection::Heuristic);

    h.rago.chat(request, &CancellationToken::new()).await.unwrap();

    let offered: Vec<String> = h
        .provider
        .request(0)
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(offered, vec!["now".to_string()]);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_heuristic_selection_offers_matching_tools() {
    let h = harness(ScriptedProvider::new()).await;
    let mut request = ChatRequest::new("What's the weather in Paris right now?").with_tools();
    request.parameters.tool_selection = Some(ToolSelection::Heuristic);

    h.rago.chat(request, &CancellationToken::new()).await.unwrap();

    let offered: Vec<String> = h
        .provider
        .request(0)
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(offered, vec!["now".to_string(), "weather".to_string()]);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_tool_loop_stops_at_the_cap() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Call("now", json!({"timezone": "UTC"})));
    provider.push(Script::Call("weather", json!({"city": "Oslo"})));
    provider.push(Script::Call("now", json!({"timezone": "CET"})));
    let h = harness(provider).await;

    let mut request = ChatRequest::new("Keep calling").with_tools();
    request.parameters.max_tool_calls = Some(2);
    let response = h.rago.chat(request, &CancellationToken::new()).await.unwrap();

    assert_eq!(response.tool_calls.len(), 2);
    assert!(response.truncated);
    assert_eq!(h.provider.calls(), 3);
    assert!(h.provider.request(2).tools.is_empty());
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_calls_beyond_the_cap_in_one_turn_are_skipped() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Calls(vec![
        ("now", json!({"timezone": "UTC"})),
        ("weather", json!({"city": "Oslo"})),
    ]));
    provider.push(Script::EchoTool);
    let h = harness(provider).await;

    let mut request = ChatRequest::new("Both please").with_tools();
    request.parameters.max_tool_calls = Some(1);
    let response = h.rago.chat(request, &CancellationToken::new()).await.unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "now");
    assert!(response.truncated);
    assert_eq!(
        response.content,
        "The tool said skipped: tool call limit reached"
    );
    assert_eq!(h.tool_log.lock().len(), 1);
    h.rago.shutdown().await;
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_stream_delivers_tool_calls_deltas_and_done() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Call("now", json!({"timezone": "UTC"})));
    provider.push(Script::Text("It is noon UTC"));
    let h = harness(provider).await;

    let mut sink = VecSink::new();
    let response = h
        .rago
        .stream_chat(
            ChatRequest::new("Time?").with_tools(),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.content, "It is noon UTC");
    let events = sink.items;
    assert!(matches!(
        &events[0],
        ChatStreamEvent::ToolCall { record } if record.name == "now"
    ));

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ChatStreamEvent::Content { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "It is noon UTC");

    match events.last() {
        Some(ChatStreamEvent::Done { response }) => {
            assert_eq!(response.content, "It is noon UTC");
            assert_eq!(response.tool_calls.len(), 1);
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_stream_holds_back_text_of_tool_turns() {
    let provider = ScriptedProvider::new();
    provider.push(Script::SayThenCall(
        "Let me check the clock. ",
        "now",
        json!({"timezone": "UTC"}),
    ));
    provider.push(Script::Text("It is noon UTC"));
    let h = harness(provider).await;

    let mut sink = VecSink::new();
    let response = h
        .rago
        .stream_chat(
            ChatRequest::new("Time?").with_tools(),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let events = sink.items;
    let first_content = events
        .iter()
        .position(|e| matches!(e, ChatStreamEvent::Content { .. }))
        .unwrap();
    let tool_call = events
        .iter()
        .position(|e| matches!(e, ChatStreamEvent::ToolCall { .. }))
        .unwrap();
    assert!(tool_call < first_content);

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ChatStreamEvent::Content { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "It is noon UTC");
    assert_eq!(response.content, "It is noon UTC");

    // The held-back text still reaches the conversation history
    assert!(response
        .context
        .iter()
        .any(|m| m.role == MessageRole::Assistant && m.content == "Let me check the clock. "));
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_event() {
    let provider = ScriptedProvider::new();
    provider.push(Script::Fail(RagoError::bad_request("prompt rejected")));
    let h = harness(provider).await;

    let mut sink = VecSink::new();
    let err = h
        .rago
        .stream_chat(ChatRequest::new("Hi"), &mut sink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(sink.items.len(), 1);
    assert!(matches!(sink.items[0], ChatStreamEvent::Error { .. }));
    h.rago.shutdown().await;
}

// ============================================================================
// Cancellation and timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_stream_delivers_nothing() {
    let mut config = base_config();
    config.mcp.enabled = false;
    let provider = ScriptedProvider::new();
    provider.push(Script::Sleep(Duration::from_secs(60)));
    let h = harness_with(config, provider, false).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let mut sink = VecSink::new();
    let err = h
        .rago
        .stream_chat(ChatRequest::new("Hi"), &mut sink, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(sink.items.is_empty());
    h.rago.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_is_transient() {
    let mut config = base_config();
    config.mcp.enabled = false;
    let provider = ScriptedProvider::new();
    provider.push(Script::Sleep(Duration::from_secs(60)));
    let h = harness_with(config, provider, false).await;

    let mut request = ChatRequest::new("Hi");
    request.parameters.timeout_secs = Some(1);
    let err = h
        .rago
        .chat(request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    h.rago.shutdown().await;
}

#[tokio::test]
async fn test_chat_after_shutdown_is_cancelled() {
    let h = harness(ScriptedProvider::new()).await;
    h.rago.shutdown().await;

    let err = h
        .rago
        .chat(ChatRequest::new("Hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}
