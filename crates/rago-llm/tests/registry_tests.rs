//! Provider Registry Integration Tests
//!
//! Exercises selection, failover, circuit breaking, cancellation and
//! streaming against scripted in-process providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use rago_core::{
    CancellationToken, ErrorKind, EventSink, GenerationRequest, GenerationResponse,
    ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk, Usage, VecSink,
};
use rago_llm::{LoadBalancingPolicy, Provider, ProviderRegistry, RegistryConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
enum Script {
    Reply(&'static str),
    Fail(RagoError),
    Sleep(Duration),
    /// Streams one chunk, then fails
    PartialThenFail,
}

struct ScriptedProvider {
    name: String,
    queue: Mutex<VecDeque<Script>>,
    fallback: Script,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &str, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn then(self: Arc<Self>, script: Script) -> Arc<Self> {
        self.queue.lock().push_back(script);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    fn model(&self) -> &str {
        "test-model"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        match self.next_script() {
            Script::Reply(text) => Ok(GenerationResponse::text(text)),
            Script::Fail(err) => Err(err),
            Script::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(GenerationResponse::text("late"))
            }
            Script::PartialThenFail => Err(RagoError::transient("HTTP 503")),
        }
    }

    async fn stream(
        &self,
        _request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        _cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        match self.next_script() {
            Script::Reply(text) => {
                for word in text.split_inclusive(' ') {
                    sink.send(StreamChunk::delta(word)).await?;
                }
                sink.send(StreamChunk::finish(vec![], Usage::new(1, 1))).await?;
                Ok(GenerationResponse::text(text))
            }
            Script::Fail(err) => Err(err),
            Script::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(GenerationResponse::text("late"))
            }
            Script::PartialThenFail => {
                sink.send(StreamChunk::delta("partial")).await?;
                Err(RagoError::transient("connection reset"))
            }
        }
    }

    async fn health_probe(&self, _timeout: Duration) -> RagoResult<()> {
        Ok(())
    }
}

fn add(registry: &ProviderRegistry, provider: &Arc<ScriptedProvider>, weight: u32) {
    registry
        .add(
            ProviderConfig::new(provider.name.clone(), ProviderType::Openai, "test-model")
                .with_weight(weight),
            provider.clone(),
        )
        .unwrap();
}

fn stats_for(registry: &ProviderRegistry, name: &str) -> rago_llm::ProviderStats {
    registry
        .stats()
        .into_iter()
        .find(|s| s.name == name)
        .unwrap()
}

fn prompt() -> GenerationRequest {
    GenerationRequest::from_prompt("Hello")
}

// ============================================================================
// Selection Tests
// ============================================================================

#[test]
fn test_weighted_selection_fairness() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a")), 2);
    add(&registry, &ScriptedProvider::new("B", Script::Reply("b")), 1);

    let n = 100;
    let mut a = 0;
    let mut b = 0;
    for _ in 0..3 * n {
        match registry.select_for(&prompt()).unwrap().name() {
            "A" => a += 1,
            "B" => b += 1,
            other => panic!("unexpected provider {}", other),
        }
    }
    assert_eq!(a, 2 * n);
    assert_eq!(b, n);
}

#[test]
fn test_round_robin_policy() {
    let registry = ProviderRegistry::new(RegistryConfig {
        policy: LoadBalancingPolicy::RoundRobin,
        ..Default::default()
    });
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a")), 5);
    add(&registry, &ScriptedProvider::new("B", Script::Reply("b")), 1);

    let names: Vec<String> = (0..4)
        .map(|_| registry.select_for(&prompt()).unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["A", "B", "A", "B"]);
}

#[test]
fn test_least_recent_policy() {
    let registry = ProviderRegistry::new(RegistryConfig {
        policy: LoadBalancingPolicy::LeastRecent,
        ..Default::default()
    });
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a")), 1);
    add(&registry, &ScriptedProvider::new("B", Script::Reply("b")), 1);
    add(&registry, &ScriptedProvider::new("C", Script::Reply("c")), 1);

    let names: Vec<String> = (0..6)
        .map(|_| registry.select_for(&prompt()).unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["A", "B", "C", "A", "B", "C"]);
}

#[test]
fn test_empty_registry_has_no_provider() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let err = registry.select_for(&prompt()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NoAvailableProvider);
    assert_eq!(err.status(), "unavailable");
}

// ============================================================================
// Failover Tests
// ============================================================================

#[tokio::test]
async fn test_failover_to_second_provider() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new("A", Script::Reply("from A"))
        .then(Script::Fail(RagoError::transient("HTTP 503: unavailable")));
    let b = ScriptedProvider::new("B", Script::Reply("from B"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    let resp = registry
        .generate(&prompt(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resp.provider, "B");
    assert_eq!(resp.content, "from B");
    assert_eq!(stats_for(&registry, "A").total_failures, 1);
    assert_eq!(stats_for(&registry, "B").total_failures, 0);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn test_non_retryable_error_is_not_retried() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new("A", Script::Fail(RagoError::bad_request("HTTP 401: bad key")));
    let b = ScriptedProvider::new("B", Script::Reply("from B"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    let err = registry
        .generate(&prompt(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(b.calls(), 0);
    assert_eq!(stats_for(&registry, "A").total_failures, 0);
}

#[tokio::test]
async fn test_input_too_large_propagates() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new(
        "A",
        Script::Fail(RagoError::input_too_large("maximum context length exceeded")),
    );
    add(&registry, &a, 1);

    let err = registry
        .generate(&prompt(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputTooLarge);
    assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn test_retries_bounded_by_max_retries() {
    let registry = ProviderRegistry::new(RegistryConfig {
        max_retries: 1,
        ..Default::default()
    });
    let providers: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|n| ScriptedProvider::new(n, Script::Fail(RagoError::transient("HTTP 502"))))
        .collect();
    for p in &providers {
        add(&registry, p, 1);
    }

    let err = registry
        .generate(&prompt(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    let total: usize = providers.iter().map(|p| p.calls()).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_empty_prompt_rejected_before_dispatch() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new("A", Script::Reply("a"));
    add(&registry, &a, 1);

    let err = registry
        .generate(&GenerationRequest::from_prompt("  "), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), "bad-request");
    assert_eq!(a.calls(), 0);
}

// ============================================================================
// Circuit Breaker Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_short_circuits_without_contacting_backend() {
    let registry = ProviderRegistry::new(RegistryConfig {
        circuit_breaker_threshold: 2,
        circuit_breaker_timeout_secs: 30,
        ..Default::default()
    });
    let a = ScriptedProvider::new("A", Script::Fail(RagoError::transient("HTTP 503")));
    add(&registry, &a, 1);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let err = registry.generate(&prompt(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
    assert_eq!(a.calls(), 2);

    for _ in 0..5 {
        let err = registry.generate(&prompt(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BreakerOpen);
    }
    assert_eq!(a.calls(), 2);
    assert_eq!(
        registry.health_map()["A"],
        rago_core::HealthStatus::Unhealthy
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    let err = registry.generate(&prompt(), &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(a.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_over_to_other_provider() {
    let registry = ProviderRegistry::new(RegistryConfig {
        circuit_breaker_threshold: 1,
        ..Default::default()
    });
    let a = ScriptedProvider::new("A", Script::Fail(RagoError::transient("HTTP 503")));
    let b = ScriptedProvider::new("B", Script::Reply("from B"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    for _ in 0..4 {
        let resp = registry
            .generate(&prompt(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "B");
    }
    assert_eq!(a.calls(), 1);
}

// ============================================================================
// Cancellation and Timeout Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_request() {
    let registry = Arc::new(ProviderRegistry::new(RegistryConfig::default()));
    let a = ScriptedProvider::new("A", Script::Sleep(Duration::from_secs(10)));
    let b = ScriptedProvider::new("B", Script::Reply("from B"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = registry.generate(&prompt(), &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(b.calls(), 0);
    assert_eq!(stats_for(&registry, "A").total_failures, 0);
    assert_eq!(stats_for(&registry, "A").in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_budget_caps_provider_timeout() {
    let registry = ProviderRegistry::new(RegistryConfig {
        max_retries: 0,
        ..Default::default()
    });
    let a = ScriptedProvider::new("A", Script::Sleep(Duration::from_secs(50)));
    add(&registry, &a, 1);

    let started = tokio::time::Instant::now();
    let err = registry
        .generate(
            &prompt().with_timeout(Duration::from_secs(2)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(started.elapsed() < Duration::from_secs(3));
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[tokio::test]
async fn test_stream_delivers_chunks_in_order() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    add(&registry, &ScriptedProvider::new("A", Script::Reply("one two three")), 1);

    let mut sink = VecSink::new();
    let resp = registry
        .stream(&prompt(), &mut sink, &CancellationToken::new())
        .await
        .unwrap();

    let text: String = sink.items.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "one two three");
    assert!(sink.items.last().unwrap().finished);
    assert_eq!(sink.items.iter().filter(|c| c.finished).count(), 1);
    assert_eq!(resp.provider, "A");
}

#[tokio::test]
async fn test_stream_failure_after_delivery_is_not_replayed() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new("A", Script::PartialThenFail);
    let b = ScriptedProvider::new("B", Script::Reply("from B"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    let mut sink = VecSink::new();
    let err = registry
        .stream(&prompt(), &mut sink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(b.calls(), 0);
    assert_eq!(sink.items.len(), 1);
}

#[tokio::test]
async fn test_stream_failure_before_delivery_fails_over() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    let a = ScriptedProvider::new("A", Script::Fail(RagoError::transient("HTTP 503")));
    let b = ScriptedProvider::new("B", Script::Reply("hello there"));
    add(&registry, &a, 1);
    add(&registry, &b, 1);

    let mut sink = VecSink::new();
    let resp = registry
        .stream(&prompt(), &mut sink, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.provider, "B");
    assert!(sink.items.last().unwrap().finished);
}

#[tokio::test]
async fn test_stream_into_closed_channel_is_cancelled() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a b c")), 1);

    let (mut tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(1);
    drop(rx);
    let err = registry
        .stream(&prompt(), &mut tx, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

// ============================================================================
// Batch and Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_batch_preserves_order_and_isolates_failures() {
    let registry = ProviderRegistry::new(RegistryConfig {
        max_retries: 0,
        batch_concurrency: 1,
        ..Default::default()
    });
    let a = ScriptedProvider::new("A", Script::Reply("ok"))
        .then(Script::Reply("first"))
        .then(Script::Fail(RagoError::bad_request("HTTP 400")))
        .then(Script::Reply("third"));
    add(&registry, &a, 1);

    let results = registry
        .batch(vec![prompt(), prompt(), prompt()], &CancellationToken::new())
        .await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().content, "first");
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap().content, "third");
}

#[tokio::test(start_paused = true)]
async fn test_background_probes_and_shutdown() {
    let registry = Arc::new(ProviderRegistry::new(RegistryConfig {
        check_interval_secs: 5,
        ..Default::default()
    }));
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a")), 1);

    registry.start_health_checks();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.health_map()["A"], rago_core::HealthStatus::Healthy);

    registry.shutdown().await;
}

#[test]
fn test_hot_remove() {
    let registry = ProviderRegistry::new(RegistryConfig::default());
    add(&registry, &ScriptedProvider::new("A", Script::Reply("a")), 1);
    add(&registry, &ScriptedProvider::new("B", Script::Reply("b")), 1);

    registry.remove("A").unwrap();
    for _ in 0..3 {
        assert_eq!(registry.select_for(&prompt()).unwrap().name(), "B");
    }
    assert_eq!(registry.list().len(), 1);
}
