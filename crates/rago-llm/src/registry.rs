//! Provider registry
//!
//! Maps provider names to live handles plus health and breaker state.
//! Selection takes the reader side of the lock; `add`/`remove` take the
//! writer side. Per-provider counters are atomics so dispatch never holds the
//! lock across an await.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rago_core::{
    CancellationToken, Component, ErrorKind, EventSink, GenerationRequest, GenerationResponse,
    HealthStatus, ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::{LlmConfig, RegistryConfig};
use crate::probe;
use crate::provider::{create_provider, Provider};
use crate::selection::{self, Candidate};

/// Public view of a registered provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
    pub model: String,
    pub weight: u32,
    pub enabled: bool,
    pub health: HealthStatus,
}

/// Counters for one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub in_flight: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub breaker: BreakerState,
    pub health: HealthStatus,
    pub last_error: Option<String>,
}

pub(crate) struct ProviderEntry {
    pub(crate) config: ProviderConfig,
    pub(crate) handle: Arc<dyn Provider>,
    breaker: CircuitBreaker,
    health: RwLock<HealthStatus>,
    enabled: AtomicBool,
    in_flight: AtomicU32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    last_used: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ProviderEntry {
    fn new(config: ProviderConfig, handle: Arc<dyn Provider>, registry: &RegistryConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                config.name.clone(),
                registry.circuit_breaker_threshold,
                registry.breaker_timeout(),
            ),
            enabled: AtomicBool::new(config.enabled),
            health: RwLock::new(HealthStatus::Unknown),
            in_flight: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_used: AtomicU64::new(0),
            last_error: Mutex::new(None),
            config,
            handle,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn health(&self) -> HealthStatus {
        *self.health.read()
    }

    pub(crate) fn set_health(&self, status: HealthStatus) {
        let mut health = self.health.write();
        let previous = *health;
        if previous != status {
            info!(provider = %self.config.name, from = %previous, to = %status, "Provider health changed");
            *health = status;
        }
    }

    /// Health as seen by callers: an open breaker reads as unhealthy
    fn effective_health(&self) -> HealthStatus {
        if self.breaker.is_open() {
            HealthStatus::Unhealthy
        } else {
            self.health()
        }
    }

    fn serves(&self, request: &GenerationRequest) -> bool {
        request
            .model
            .as_deref()
            .map_or(true, |model| self.config.serves(model))
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.breaker.record_success();
    }

    fn record_failure(&self, err: &RagoError) {
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock() = Some(err.to_string());
        self.breaker.record_failure();
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            provider_type: self.config.provider_type,
            endpoint: self.config.endpoint().to_string(),
            model: self.config.model.clone(),
            weight: self.config.weight,
            enabled: self.is_enabled(),
            health: self.effective_health(),
        }
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            name: self.config.name.clone(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            total_requests: self.total_requests.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            breaker: self.breaker.state(),
            health: self.health(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Decrements the in-flight counter when an attempt ends, however it ends
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts chunks that reached the caller; once one has, an attempt cannot
/// be replayed on another provider
struct CountingSink<'a> {
    inner: &'a mut dyn EventSink<StreamChunk>,
    delivered: &'a AtomicUsize,
}

#[async_trait]
impl EventSink<StreamChunk> for CountingSink<'_> {
    async fn send(&mut self, item: StreamChunk) -> RagoResult<()> {
        self.inner.send(item).await?;
        self.delivered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Plain,
    WithTools,
}

pub struct ProviderRegistry {
    config: RegistryConfig,
    providers: RwLock<Vec<Arc<ProviderEntry>>>,
    /// Draw counter for deterministic selection
    counter: AtomicUsize,
    /// Sequence stamp for least-recent selection
    sequence: AtomicU64,
    shutdown: CancellationToken,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            prober: Mutex::new(None),
        }
    }

    /// Builds a registry and instantiates every configured provider
    pub fn from_config(config: &LlmConfig) -> RagoResult<Self> {
        config.validate()?;
        let registry = Self::new(config.registry.clone());
        for provider in &config.providers {
            registry.add_provider(provider.clone())?;
        }
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers an already-built handle under `config.name`
    pub fn add(&self, config: ProviderConfig, handle: Arc<dyn Provider>) -> RagoResult<()> {
        config.validate()?;
        let mut providers = self.providers.write();
        if providers.iter().any(|e| e.name() == config.name) {
            return Err(RagoError::conflict(format!(
                "provider '{}' already registered",
                config.name
            ))
            .at(Component::Llm, "add"));
        }
        info!(
            provider = %config.name,
            provider_type = %config.provider_type,
            model = %config.model,
            weight = config.weight,
            "Registered provider"
        );
        providers.push(Arc::new(ProviderEntry::new(config, handle, &self.config)));
        Ok(())
    }

    /// Instantiates the backend named by `config.provider_type` and registers it
    pub fn add_provider(&self, config: ProviderConfig) -> RagoResult<()> {
        let handle = create_provider(config.clone())?;
        self.add(config, handle)
    }

    /// Hot-removes a provider; in-flight requests against it run to completion
    pub fn remove(&self, name: &str) -> RagoResult<()> {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|e| e.name() != name);
        if providers.len() == before {
            return Err(RagoError::not_found(format!("provider '{}' not registered", name))
                .at(Component::Llm, "remove"));
        }
        info!(provider = %name, "Removed provider");
        Ok(())
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().iter().map(|e| e.info()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entry(name).map(|e| e.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> RagoResult<()> {
        let entry = self.entry(name).ok_or_else(|| {
            RagoError::not_found(format!("provider '{}' not registered", name))
                .at(Component::Llm, "set_enabled")
        })?;
        entry.enabled.store(enabled, Ordering::Release);
        info!(provider = %name, enabled, "Provider toggled");
        Ok(())
    }

    /// Overrides a provider's health; probes overwrite it on their next run
    pub fn set_health(&self, name: &str, status: HealthStatus) -> RagoResult<()> {
        let entry = self.entry(name).ok_or_else(|| {
            RagoError::not_found(format!("provider '{}' not registered", name))
                .at(Component::Llm, "set_health")
        })?;
        entry.set_health(status);
        Ok(())
    }

    pub fn health_map(&self) -> BTreeMap<String, HealthStatus> {
        self.providers
            .read()
            .iter()
            .map(|e| (e.config.name.clone(), e.effective_health()))
            .collect()
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers.read().iter().map(|e| e.stats()).collect()
    }

    /// Rolled-up status of the enabled providers
    pub fn pillar_status(&self) -> HealthStatus {
        let statuses: Vec<HealthStatus> = self
            .providers
            .read()
            .iter()
            .filter(|e| e.is_enabled())
            .map(|e| e.effective_health())
            .collect();
        if statuses.is_empty() {
            return HealthStatus::Unhealthy;
        }
        if statuses.iter().all(|s| *s == HealthStatus::Unknown) {
            return HealthStatus::Unknown;
        }
        HealthStatus::aggregate(statuses.into_iter().filter(|s| *s != HealthStatus::Unknown))
    }

    /// Chooses the provider that would serve `request` next
    pub fn select_for(&self, request: &GenerationRequest) -> RagoResult<Arc<dyn Provider>> {
        self.select_entry(request, &[]).map(|e| e.handle.clone())
    }

    pub(crate) fn entries(&self) -> Vec<Arc<ProviderEntry>> {
        self.providers.read().clone()
    }

    fn entry(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.providers
            .read()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    fn select_entry(
        &self,
        request: &GenerationRequest,
        tried: &[String],
    ) -> RagoResult<Arc<ProviderEntry>> {
        let providers = self.providers.read();
        let candidates: Vec<&Arc<ProviderEntry>> = providers
            .iter()
            .filter(|e| e.is_enabled() && e.serves(request))
            .filter(|e| !tried.iter().any(|t| t == e.name()))
            .collect();

        if candidates.is_empty() {
            let message = match &request.model {
                Some(model) => format!("no enabled provider serves model '{}'", model),
                None => "no enabled provider".to_string(),
            };
            return Err(RagoError::new(ErrorKind::NoAvailableProvider, message)
                .at(Component::Llm, "select"));
        }

        let closed: Vec<&Arc<ProviderEntry>> = candidates
            .iter()
            .copied()
            .filter(|e| !e.breaker.is_open())
            .collect();
        if closed.is_empty() {
            let names: Vec<&str> = candidates.iter().map(|e| e.name()).collect();
            return Err(RagoError::new(
                ErrorKind::BreakerOpen,
                format!("circuit open for {}", names.join(", ")),
            )
            .at(Component::Llm, "select"));
        }

        let healthy: Vec<&Arc<ProviderEntry>> = closed
            .iter()
            .copied()
            .filter(|e| matches!(e.health(), HealthStatus::Healthy | HealthStatus::Unknown))
            .collect();
        let tier = if healthy.is_empty() {
            closed
                .iter()
                .copied()
                .filter(|e| e.health() == HealthStatus::Degraded)
                .collect()
        } else {
            healthy
        };
        if tier.is_empty() {
            return Err(RagoError::new(
                ErrorKind::NoAvailableProvider,
                "no healthy or degraded provider",
            )
            .at(Component::Llm, "select"));
        }

        let views: Vec<Candidate> = tier
            .iter()
            .map(|e| Candidate {
                weight: e.config.weight,
                last_used: e.last_used.load(Ordering::Acquire),
            })
            .collect();
        let draw = self.counter.fetch_add(1, Ordering::AcqRel);
        let chosen = tier[selection::pick(self.config.policy, &views, draw)].clone();
        let stamp = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        chosen.last_used.store(stamp, Ordering::Release);
        debug!(provider = %chosen.name(), policy = ?self.config.policy, "Selected provider");
        Ok(chosen)
    }

    /// Plain generation; any tools on the request are dropped
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let mut request = request.clone();
        request.tools.clear();
        self.dispatch(&request, None, Mode::Plain, cancel, "generate")
            .await
    }

    pub async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        let mut request = request.clone();
        request.tools.clear();
        self.dispatch(&request, Some(sink), Mode::Plain, cancel, "stream")
            .await
    }

    /// Generation that may return tool calls; the registry never runs them
    pub async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        self.dispatch(request, None, Mode::WithTools, cancel, "generate_with_tools")
            .await
    }

    pub async fn stream_with_tools(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        self.dispatch(request, Some(sink), Mode::WithTools, cancel, "stream_with_tools")
            .await
    }

    /// Runs requests with bounded concurrency; results keep input order and
    /// one failure does not abort the rest
    pub async fn batch(
        &self,
        requests: Vec<GenerationRequest>,
        cancel: &CancellationToken,
    ) -> Vec<RagoResult<GenerationResponse>> {
        let concurrency = self.config.batch_concurrency.max(1);
        stream::iter(requests)
            .map(|request| async move { self.generate_with_tools(&request, cancel).await })
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn dispatch(
        &self,
        request: &GenerationRequest,
        mut sink: Option<&mut dyn EventSink<StreamChunk>>,
        mode: Mode,
        cancel: &CancellationToken,
        operation: &'static str,
    ) -> RagoResult<GenerationResponse> {
        request.validate().map_err(|e| e.at(Component::Llm, operation))?;

        let attempts = self.config.max_retries + 1;
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<RagoError> = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(RagoError::cancelled().at(Component::Llm, operation));
            }

            let entry = match self.select_entry(request, &tried) {
                Ok(entry) => entry,
                Err(e) => return Err(last_error.unwrap_or(e).at(Component::Llm, operation)),
            };
            tried.push(entry.name().to_string());

            if !entry.breaker.try_acquire() {
                last_error = Some(
                    RagoError::new(
                        ErrorKind::BreakerOpen,
                        format!("circuit open for {}", entry.name()),
                    )
                    .at(Component::Llm, operation),
                );
                continue;
            }

            let timeout = entry.config.timeout();
            let timeout = request.timeout.map_or(timeout, |budget| timeout.min(budget));
            let mut attempt_request = request.clone();
            attempt_request.timeout = Some(timeout);

            entry.total_requests.fetch_add(1, Ordering::AcqRel);
            let _in_flight = InFlight::enter(&entry.in_flight);
            let delivered = AtomicUsize::new(0);
            let handle = entry.handle.clone();

            let call = async {
                match sink.as_deref_mut() {
                    Some(inner) => {
                        let mut counting = CountingSink {
                            inner,
                            delivered: &delivered,
                        };
                        match mode {
                            Mode::Plain => {
                                handle.stream(&attempt_request, &mut counting, cancel).await
                            }
                            Mode::WithTools => {
                                handle
                                    .stream_with_tools(&attempt_request, &mut counting, cancel)
                                    .await
                            }
                        }
                    }
                    None => match mode {
                        Mode::Plain => handle.generate(&attempt_request, cancel).await,
                        Mode::WithTools => {
                            handle.generate_with_tools(&attempt_request, cancel).await
                        }
                    },
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RagoError::cancelled()),
                outcome = tokio::time::timeout(timeout, call) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(RagoError::transient(format!(
                        "provider '{}' timed out after {}ms",
                        entry.name(),
                        timeout.as_millis()
                    ))),
                },
            };

            match result {
                Ok(mut response) => {
                    entry.record_success();
                    response.provider = entry.name().to_string();
                    if response.model.is_empty() {
                        response.model = entry.config.model.clone();
                    }
                    if attempt > 0 {
                        info!(provider = %entry.name(), attempt, "Request succeeded after failover");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_cancelled() => {
                    entry.breaker.release();
                    debug!(provider = %entry.name(), "Request cancelled");
                    return Err(e.at(Component::Llm, operation));
                }
                Err(e) if e.is_retryable() => {
                    entry.record_failure(&e);
                    warn!(
                        provider = %entry.name(),
                        attempt,
                        error = %e,
                        "Provider attempt failed"
                    );
                    if delivered.load(Ordering::Acquire) > 0 {
                        return Err(e.at(Component::Llm, operation));
                    }
                    last_error = Some(e.at(Component::Llm, operation));
                }
                Err(e) => {
                    entry.breaker.release();
                    *entry.last_error.lock() = Some(e.to_string());
                    return Err(e.at(Component::Llm, operation));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RagoError::new(ErrorKind::NoAvailableProvider, "retries exhausted")
                .at(Component::Llm, operation)
        }))
    }

    /// Probes every provider once and applies the results
    pub async fn probe_all(&self) -> BTreeMap<String, HealthStatus> {
        probe::probe_entries(&self.entries(), self.config.probe_timeout()).await;
        self.health_map()
    }

    /// Starts the background prober; a second call is a no-op
    pub fn start_health_checks(self: &Arc<Self>) {
        let mut prober = self.prober.lock();
        if prober.is_some() {
            return;
        }
        *prober = Some(probe::spawn(
            Arc::downgrade(self),
            self.config.check_interval(),
            self.shutdown.clone(),
        ));
    }

    /// Stops background probing and waits for the task to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.prober.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Provider registry stopped");
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("config", &self.config)
            .field("providers", &self.list())
            .finish()
    }
}
