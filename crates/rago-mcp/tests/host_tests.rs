//! Tool Host Integration Tests
//!
//! Drives the host against in-process servers speaking the real wire format,
//! plus the `rago-tool-fixture` binary when it has been built.

use rago_core::{CancellationToken, ErrorKind, HealthStatus, ServerState};
use rago_mcp::{
    remote_tool, DuplexLauncher, FnToolHandler, Framing, McpConfig, Reply, ServerConfig,
    ToolEvent, ToolHost, ToolRequest,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn calculator(calls: Arc<AtomicUsize>) -> FnToolHandler {
    let numbers = json!({
        "type": "object",
        "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
        "required": ["a", "b"]
    });
    FnToolHandler::new(
        vec![
            remote_tool("add", "Add two numbers", numbers),
            remote_tool(
                "echo",
                "Echo text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            ),
            remote_tool("hang", "Never answers", json!({"type": "object"})),
            remote_tool("crash", "Exits the server", json!({"type": "object"})),
            remote_tool("fail", "Always reports failure", json!({"type": "object"})),
        ],
        move |name, args| {
            calls.fetch_add(1, Ordering::SeqCst);
            match name {
                "add" => {
                    let a = args["a"].as_f64().unwrap_or_default();
                    let b = args["b"].as_f64().unwrap_or_default();
                    Reply::Result(json!({"sum": a + b}))
                }
                "echo" => Reply::Result(args["text"].clone()),
                "hang" => Reply::Ignore,
                "crash" => Reply::Crash,
                "fail" => Reply::Error("boom".to_string()),
                _ => Reply::RpcError(-32601, format!("no tool {}", name)),
            }
        },
    )
}

fn launcher() -> (Arc<DuplexLauncher>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (Arc::new(DuplexLauncher::new(calculator(calls.clone()))), calls)
}

async fn start_host(config: McpConfig, launcher: Arc<DuplexLauncher>) -> ToolHost {
    let host = ToolHost::with_launcher(config, launcher).unwrap();
    host.start().await.unwrap();
    host
}

fn single(server: ServerConfig) -> McpConfig {
    McpConfig::default().with_server(server)
}

fn add_args(a: i64, b: i64) -> Value {
    json!({"a": a, "b": b})
}

// ============================================================================
// Catalog and Calls
// ============================================================================

#[tokio::test]
async fn test_start_publishes_catalog() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher.clone()).await;

    assert_eq!(host.server_state("calc"), Some(ServerState::Running));
    let names: Vec<String> = host.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["add", "echo", "hang", "crash", "fail"]);

    let add = host.get_tool("add").unwrap();
    assert_eq!(add.server_name, "calc");
    assert!(add.enabled);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(host.pillar_status(), HealthStatus::Healthy);
    host.shutdown().await;
}

#[tokio::test]
async fn test_call_tool_returns_result() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;
    let cancel = CancellationToken::new();

    let out = host.call_tool("add", add_args(1, 2), None, &cancel).await.unwrap();
    assert!(!out.is_error);
    assert!(!out.cached);
    assert_eq!(out.value()["sum"], 3.0);

    let echoed = host
        .call_tool("echo", json!({"text": "hi"}), None, &cancel)
        .await
        .unwrap();
    assert_eq!(echoed.text(), "hi");
    host.shutdown().await;
}

#[tokio::test]
async fn test_tool_level_error_is_not_a_failure() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;

    let out = host
        .call_tool("fail", json!({}), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(out.is_error);
    assert_eq!(out.text(), "boom");
    host.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_and_bad_arguments() {
    let (launcher, calls) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;
    let cancel = CancellationToken::new();

    let err = host.call_tool("nope", json!({}), None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = host
        .call_tool("add", json!({"a": 1}), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArguments);

    let err = host
        .call_tool("add", json!({"a": "one", "b": 2}), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArguments);

    // nothing reached the server
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_unknown_argument_emits_warning() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;
    let mut events = host.subscribe();

    let out = host
        .call_tool("add", json!({"a": 1, "b": 1, "c": 9}), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.value()["sum"], 2.0);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        if let ToolEvent::Warning { tool, message } = event {
            assert_eq!(tool, "add");
            assert!(message.contains("'c'"));
            warned = true;
        }
    }
    assert!(warned);
    host.shutdown().await;
}

#[tokio::test]
async fn test_colliding_names_are_namespaced() {
    let (launcher, _) = launcher();
    let config = McpConfig::default()
        .with_server(ServerConfig::new("alpha", "calc"))
        .with_server(ServerConfig::new("beta", "calc"));
    let host = start_host(config, launcher.clone()).await;

    assert_eq!(launcher.launches(), 2);
    assert_eq!(host.get_tool("add").unwrap().server_name, "alpha");
    let shadowed = host.get_tool("beta.add").unwrap();
    assert_eq!(shadowed.server_name, "beta");
    assert_eq!(shadowed.remote_name, "add");
    assert_eq!(host.get_tool("alpha.add").unwrap().name, "add");
    assert_eq!(host.list_tools().len(), 10);

    let out = host
        .call_tool("beta.add", add_args(2, 2), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.value()["sum"], 4.0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_length_framing() {
    let (launcher, _) = launcher();
    let server = ServerConfig::new("calc", "calc").with_framing(Framing::Length);
    let host = start_host(single(server), launcher).await;

    let out = host
        .call_tool("add", add_args(20, 22), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.value()["sum"], 42.0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_server_log_becomes_event() {
    let (launcher, _) = launcher();
    let host = ToolHost::with_launcher(single(ServerConfig::new("calc", "calc")), launcher).unwrap();
    let mut events = host.subscribe();
    host.start().await.unwrap();

    let saw_log = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ToolEvent::Log { server, message, .. }) => break (server, message),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(saw_log, ("calc".to_string(), "calc ready".to_string()));
    host.shutdown().await;
}

// ============================================================================
// Async and Batch Calls
// ============================================================================

#[tokio::test]
async fn test_call_async_delivers_on_channel() {
    let (launcher, _) = launcher();
    let host = Arc::new(start_host(single(ServerConfig::new("calc", "calc")), launcher).await);

    let rx = host.call_async("add", add_args(5, 6), None, CancellationToken::new());
    let out = rx.await.unwrap().unwrap();
    assert_eq!(out.value()["sum"], 11.0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_batch_preserves_order_and_isolates_failures() {
    let (launcher, _) = launcher();
    let mut config = single(ServerConfig::new("calc", "calc"));
    config.servers[0].max_in_flight = 4;
    let host = start_host(config, launcher).await;

    let results = host
        .call_batch(
            vec![
                ToolRequest::new("add", add_args(1, 1)),
                ToolRequest::new("missing", json!({})),
                ToolRequest::new("echo", json!({"text": "third"})),
                ToolRequest::new("add", json!({"a": 1})),
                ToolRequest::new("hang", json!({})).with_timeout(Duration::from_millis(50)),
            ],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(results.len(), 5);
    assert_eq!(results[0].as_ref().unwrap().value()["sum"], 2.0);
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(results[2].as_ref().unwrap().text(), "third");
    assert_eq!(results[3].as_ref().unwrap_err().kind(), ErrorKind::InvalidArguments);
    assert_eq!(results[4].as_ref().unwrap_err().kind(), ErrorKind::ToolTimeout);
    host.shutdown().await;
}

// ============================================================================
// Timeouts and Cancellation
// ============================================================================

#[tokio::test]
async fn test_timeout_leaves_server_running() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher.clone()).await;
    let cancel = CancellationToken::new();

    let err = host
        .call_tool("hang", json!({}), Some(Duration::from_millis(50)), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolTimeout);
    assert_eq!(host.server_state("calc"), Some(ServerState::Running));

    // the slot was released and the interrupt reached the server first
    let out = host.call_tool("add", add_args(1, 2), None, &cancel).await.unwrap();
    assert_eq!(out.value()["sum"], 3.0);
    assert_eq!(launcher.interrupts(), 1);
    assert_eq!(launcher.launches(), 1);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_call() {
    let (launcher, _) = launcher();
    let mut config = single(ServerConfig::new("calc", "calc"));
    config.hard_cancel_timeout_secs = 5;
    let host = start_host(config, launcher.clone()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = host.call_tool("hang", json!({}), None, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.interrupts(), 1);
    assert_eq!(host.server_state("calc"), Some(ServerState::Running));
    assert_eq!(launcher.launches(), 1);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ignored_interrupt_restarts_server() {
    let (launcher, _) = launcher();
    let mut config = single(ServerConfig::new("calc", "calc"));
    config.hard_cancel_timeout_secs = 2;
    let host = start_host(config, launcher.clone()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let err = host.call_tool("hang", json!({}), None, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    // still inside the grace window
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(launcher.launches(), 1);

    // grace expires at 2s, first restart waits one more second
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(launcher.launches(), 2);
    assert_eq!(host.server_state("calc"), Some(ServerState::Running));
    assert_eq!(host.server_status()[0].restart_count, 1);

    let out = host
        .call_tool("add", add_args(2, 3), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.value()["sum"], 5.0);
    host.shutdown().await;
}

#[tokio::test]
async fn test_already_cancelled_call_never_dispatches() {
    let (launcher, calls) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    host.shutdown().await;
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_cache_hits_and_bypass() {
    let (launcher, calls) = launcher();
    let mut config = single(ServerConfig::new("calc", "calc"));
    config.enable_cache = true;
    let host = start_host(config, launcher).await;
    let cancel = CancellationToken::new();

    let first = host.call_tool("add", add_args(1, 2), None, &cancel).await.unwrap();
    assert!(!first.cached);
    let second = host
        .call_tool("add", json!({"b": 2, "a": 1}), None, &cancel)
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let bypassed = host
        .call_tool("add", json!({"a": 1, "b": 2, "_no_cache": true}), None, &cancel)
        .await
        .unwrap();
    assert!(!bypassed.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // failures are never cached
    host.call_tool("fail", json!({}), None, &cancel).await.unwrap();
    host.call_tool("fail", json!({}), None, &cancel).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    host.shutdown().await;
}

#[tokio::test]
async fn test_cache_disabled_by_default() {
    let (launcher, calls) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher).await;
    let cancel = CancellationToken::new();

    host.call_tool("add", add_args(1, 2), None, &cancel).await.unwrap();
    let again = host.call_tool("add", add_args(1, 2), None, &cancel).await.unwrap();
    assert!(!again.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    host.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_lazy_server_starts_on_first_call() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc").lazy()), launcher.clone()).await;

    assert_eq!(launcher.launches(), 0);
    assert_eq!(host.server_state("calc"), Some(ServerState::NotStarted));
    assert!(host.list_tools().is_empty());
    assert_eq!(host.health()["calc"], HealthStatus::Unknown);

    let out = host
        .call_tool("add", add_args(3, 4), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.value()["sum"], 7.0);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(host.server_state("calc"), Some(ServerState::Running));
    host.shutdown().await;
}

#[tokio::test]
async fn test_stop_and_start_server() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher.clone()).await;
    let cancel = CancellationToken::new();

    host.stop_server("calc").await.unwrap();
    assert_eq!(host.server_state("calc"), Some(ServerState::Stopped));
    assert!(!host.get_tool("add").unwrap().enabled);
    assert_eq!(host.health()["calc"], HealthStatus::Unhealthy);

    let err = host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolServerUnavailable);

    let state = host.start_server("calc").await.unwrap();
    assert_eq!(state, ServerState::Running);
    assert!(host.get_tool("add").unwrap().enabled);
    assert_eq!(launcher.launches(), 2);
    host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap();

    let err = host.stop_server("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crash_restarts_with_backoff() {
    let (launcher, _) = launcher();
    let host = start_host(single(ServerConfig::new("calc", "calc")), launcher.clone()).await;
    let cancel = CancellationToken::new();

    let err = host.call_tool("crash", json!({}), None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolServerUnavailable);

    // first restart waits one second
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(host.server_state("calc"), Some(ServerState::Running));
    assert_eq!(launcher.launches(), 2);

    let status = &host.server_status()[0];
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.tool_count, 5);

    let out = host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap();
    assert_eq!(out.value()["sum"], 2.0);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_cap_stops_server() {
    let (launcher, _) = launcher();
    let server = ServerConfig::new("calc", "calc").with_max_restarts(2);
    let host = start_host(single(server), launcher.clone()).await;
    let mut events = host.subscribe();
    let cancel = CancellationToken::new();

    launcher.set_dead_on_arrival(true);
    let _ = host.call_tool("crash", json!({}), None, &cancel).await;

    // backoff is 1s then 2s; both restarts fail
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(host.server_state("calc"), Some(ServerState::Stopped));
    assert_eq!(launcher.launches(), 3);
    assert_eq!(host.server_status()[0].restart_count, 2);
    assert_eq!(host.health()["calc"], HealthStatus::Unhealthy);
    assert_eq!(host.pillar_status(), HealthStatus::Unhealthy);

    // stays stopped
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(launcher.launches(), 3);
    let err = host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolServerUnavailable);

    let mut crashes = 0;
    while let Ok(event) = events.try_recv() {
        if let ToolEvent::StateChanged { to: ServerState::Crashed, .. } = event {
            crashes += 1;
        }
    }
    assert_eq!(crashes, 3);

    // an operator re-enables it
    launcher.set_dead_on_arrival(false);
    assert_eq!(host.enable_server("calc").await.unwrap(), ServerState::Running);
    assert_eq!(host.server_status()[0].restart_count, 0);
    host.call_tool("add", add_args(1, 1), None, &cancel).await.unwrap();
    host.shutdown().await;
}

#[tokio::test]
async fn test_disabled_host() {
    let (launcher, _) = launcher();
    let mut config = single(ServerConfig::new("calc", "calc"));
    config.enabled = false;
    let host = start_host(config, launcher.clone()).await;

    assert_eq!(launcher.launches(), 0);
    assert!(host.list_tools().is_empty());
    assert_eq!(host.pillar_status(), HealthStatus::Unknown);
    let err = host
        .call_tool("add", add_args(1, 1), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolServerUnavailable);
}

// ============================================================================
// Child Process
// ============================================================================

fn find_fixture() -> Option<String> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    ["target/debug/rago-tool-fixture", "target/release/rago-tool-fixture"]
        .iter()
        .map(|p| root.join(p))
        .find(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string())
}

#[tokio::test]
async fn test_child_process_fixture() {
    let Some(binary) = find_fixture() else {
        eprintln!("rago-tool-fixture binary not found, skipping child process test");
        return;
    };

    let host = ToolHost::new(single(ServerConfig::new("fixture", binary))).unwrap();
    host.start().await.unwrap();
    assert_eq!(host.server_state("fixture"), Some(ServerState::Running));
    let cancel = CancellationToken::new();

    let out = host
        .call_tool("echo", json!({"text": "over stdio"}), None, &cancel)
        .await
        .unwrap();
    assert_eq!(out.text(), "over stdio");

    let out = host.call_tool("add", add_args(40, 2), None, &cancel).await.unwrap();
    assert_eq!(out.value()["sum"], 42.0);

    let err = host
        .call_tool("delay", json!({"ms": 5000}), Some(Duration::from_millis(100)), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolTimeout);
    host.shutdown().await;
}
