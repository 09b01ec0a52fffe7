//! Client composition and lifecycle

use rago_agents::WorkflowEngine;
use rago_core::{
    CancellationToken, Component, Document, Embedder, ErrorKind, HealthReport, Pillar,
    ProviderConfig, ProviderType, RagoError, RagoResult, SearchResult,
};
use rago_llm::{HttpEmbedder, HttpEmbedderConfig, Provider, ProviderRegistry};
use rago_mcp::{Launcher, ToolHost};
use rago_rag::{
    EmbeddingBackend, EmbeddingConfig, HashEmbedder, IngestResult, KeywordStore, RetrievalEngine,
    SearchQuery, VectorStore,
};
use rago_state::{open_store, StateStore};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::PillarBackend;
use crate::config::RagoConfig;
use crate::health::{HealthMonitor, Pillars};

/// Builds a [`Rago`] client from configuration, with optional injected
/// parts in place of the ones the configuration would create
pub struct RagoBuilder {
    config: RagoConfig,
    providers: Vec<(ProviderConfig, Arc<dyn Provider>)>,
    embedder: Option<Arc<dyn Embedder>>,
    stores: Option<(Arc<dyn VectorStore>, Arc<dyn KeywordStore>)>,
    launcher: Option<Arc<dyn Launcher>>,
    state_store: Option<Arc<dyn StateStore>>,
}

impl RagoBuilder {
    pub fn new(config: RagoConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            embedder: None,
            stores: None,
            launcher: None,
            state_store: None,
        }
    }

    /// Adds a provider handle next to the configured ones
    pub fn with_provider(mut self, config: ProviderConfig, handle: Arc<dyn Provider>) -> Self {
        self.providers.push((config, handle));
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_stores(
        mut self,
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<dyn KeywordStore>,
    ) -> Self {
        self.stores = Some((vectors, keywords));
        self
    }

    /// Launcher used for every tool server
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub async fn build(self) -> RagoResult<Rago> {
        let config = self.config;
        config.validate()?;

        let llm = if config.pillar_enabled(Pillar::Llm) {
            let registry = ProviderRegistry::from_config(&config.llm)?;
            for (provider, handle) in self.providers {
                registry.add(provider, handle)?;
            }
            Some(Arc::new(registry))
        } else {
            None
        };

        let rag = if config.pillar_enabled(Pillar::Rag) {
            let embedder = match self.embedder {
                Some(embedder) => embedder,
                None => create_embedder(&config.rag.embedding)?,
            };
            let engine = match self.stores {
                Some((vectors, keywords)) => {
                    RetrievalEngine::with_stores(config.rag.clone(), embedder, vectors, keywords)?
                }
                None => RetrievalEngine::new(config.rag.clone(), embedder)?,
            };
            Some(Arc::new(engine))
        } else {
            None
        };

        let tools = if config.pillar_enabled(Pillar::Tools) {
            let host = match self.launcher {
                Some(launcher) => ToolHost::with_launcher(config.mcp.clone(), launcher)?,
                None => ToolHost::new(config.mcp.clone())?,
            };
            Some(Arc::new(host))
        } else {
            None
        };

        let agents = if config.pillar_enabled(Pillar::Agents) {
            let store = match self.state_store {
                Some(store) => store,
                None => {
                    open_store(config.agents.state_backend, Some(&config.state_dir())).await?
                }
            };
            let backend = Arc::new(PillarBackend::new(llm.clone(), tools.clone()));
            let mut agents_config = config.agents.clone();
            agents_config.hard_cancel_timeout_secs = config.mcp.hard_cancel_timeout_secs;
            Some(WorkflowEngine::new(agents_config, backend, store).await?)
        } else {
            None
        };

        let pillars = Pillars {
            llm,
            rag,
            tools,
            agents,
        };
        let health = Arc::new(HealthMonitor::new(pillars.clone()));
        info!(
            mode = ?config.mode,
            llm = pillars.llm.is_some(),
            rag = pillars.rag.is_some(),
            tools = pillars.tools.is_some(),
            agents = pillars.agents.is_some(),
            "RAGO client ready"
        );
        Ok(Rago {
            config,
            pillars,
            health,
            root: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

fn create_embedder(config: &EmbeddingConfig) -> RagoResult<Arc<dyn Embedder>> {
    let provider_type = match config.backend {
        EmbeddingBackend::Hash => return Ok(Arc::new(HashEmbedder::new(config.dimension)?)),
        EmbeddingBackend::Openai => ProviderType::Openai,
        EmbeddingBackend::Ollama => ProviderType::Ollama,
    };
    let mut http = HttpEmbedderConfig::new(provider_type, config.model.clone(), config.dimension);
    http.endpoint = config.endpoint.clone();
    http.api_key = config.api_key.clone();
    http.timeout_secs = config.timeout_secs;
    Ok(Arc::new(HttpEmbedder::new(http)?))
}

/// The client: owns every pillar for its lifetime
pub struct Rago {
    pub(crate) config: RagoConfig,
    pub(crate) pillars: Pillars,
    health: Arc<HealthMonitor>,
    /// Parent of every request scope; cancelled on shutdown
    root: CancellationToken,
    started: AtomicBool,
}

impl Rago {
    pub async fn new(config: RagoConfig) -> RagoResult<Self> {
        RagoBuilder::new(config).build().await
    }

    pub fn builder(config: RagoConfig) -> RagoBuilder {
        RagoBuilder::new(config)
    }

    /// Loads configuration (see [`RagoConfig::load`]) and builds the client
    pub async fn from_config_file(path: Option<&Path>) -> RagoResult<Self> {
        Self::new(RagoConfig::load(path)?).await
    }

    pub fn config(&self) -> &RagoConfig {
        &self.config
    }

    pub fn llm(&self) -> Option<&Arc<ProviderRegistry>> {
        self.pillars.llm.as_ref()
    }

    pub fn rag(&self) -> Option<&Arc<RetrievalEngine>> {
        self.pillars.rag.as_ref()
    }

    pub fn tools(&self) -> Option<&Arc<ToolHost>> {
        self.pillars.tools.as_ref()
    }

    pub fn agents(&self) -> Option<&WorkflowEngine> {
        self.pillars.agents.as_ref()
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Starts background work: provider probes, tool servers, the scheduler
    /// and the health ticker. Idempotent.
    pub async fn start(&self) -> RagoResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(llm) = &self.pillars.llm {
            llm.start_health_checks();
        }
        if let Some(tools) = &self.pillars.tools {
            tools.start().await?;
        }
        if let Some(agents) = &self.pillars.agents {
            agents.start();
        }
        if self.config.health.enabled {
            self.health.start(self.config.health.check_interval());
        }
        info!("RAGO client started");
        Ok(())
    }

    /// Cancels in-flight requests and stops the pillars in reverse order of
    /// creation, waiting for their background tasks
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.health.shutdown().await;
        if let Some(agents) = &self.pillars.agents {
            agents.shutdown().await;
        }
        if let Some(tools) = &self.pillars.tools {
            tools.shutdown().await;
        }
        if let Some(llm) = &self.pillars.llm {
            llm.shutdown().await;
        }
        info!("RAGO client stopped");
    }

    /// Fast health check: providers are probed, other pillars report their
    /// last known status
    pub async fn health(&self) -> HealthReport {
        self.health.check().await
    }

    pub async fn full_health_check(&self) -> HealthReport {
        self.health.full_check().await
    }

    pub(crate) fn llm_pillar(&self, operation: &str) -> RagoResult<&Arc<ProviderRegistry>> {
        self.pillars.llm.as_ref().ok_or_else(|| {
            RagoError::new(ErrorKind::NoExecutionBackend, "generation pillar is disabled")
                .at(Component::Orchestrator, operation)
        })
    }

    pub(crate) fn rag_pillar(&self, operation: &str) -> RagoResult<&Arc<RetrievalEngine>> {
        self.pillars.rag.as_ref().ok_or_else(|| {
            RagoError::bad_request("retrieval pillar is disabled")
                .at(Component::Orchestrator, operation)
        })
    }

    pub(crate) fn tools_pillar(&self, operation: &str) -> RagoResult<&Arc<ToolHost>> {
        self.pillars.tools.as_ref().ok_or_else(|| {
            RagoError::bad_request("tool pillar is disabled").at(Component::Orchestrator, operation)
        })
    }

    // Retrieval pass-throughs

    pub async fn ingest(
        &self,
        doc: Document,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> RagoResult<IngestResult> {
        let rag = self.rag_pillar("ingest")?;
        self.scoped(cancel, None, |token| async move {
            rag.ingest(doc, overwrite, &token).await
        })
        .await
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let rag = self.rag_pillar("search")?;
        self.scoped(cancel, None, |token| async move {
            rag.search(query, &token).await
        })
        .await
    }

    pub async fn hybrid_search(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let rag = self.rag_pillar("hybrid_search")?;
        self.scoped(cancel, None, |token| async move {
            rag.hybrid_search(query, &token).await
        })
        .await
    }

    pub async fn delete_document(&self, id: &str) -> RagoResult<usize> {
        self.rag_pillar("delete_document")?.delete_document(id).await
    }

    /// Runs `op` under a request scope
    ///
    /// The scope's token is cancelled by the caller's token, by client
    /// shutdown and by the request timeout (`timeout` or the configured
    /// default). After cancellation the operation gets the tool host's hard
    /// cancel timeout to wind down before the call returns anyway.
    pub(crate) async fn scoped<F, Fut, T>(
        &self,
        caller: &CancellationToken,
        timeout: Option<Duration>,
        op: F,
    ) -> RagoResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = RagoResult<T>>,
    {
        let token = self.root.child_token();
        let _guard = token.clone().drop_guard();
        let budget = timeout.unwrap_or_else(|| self.config.orchestrator.request_timeout());
        let grace = self.config.mcp.hard_cancel_timeout();

        let work = op(token.clone());
        tokio::pin!(work);
        let timed_out = tokio::select! {
            biased;
            result = &mut work => return result,
            _ = caller.cancelled() => false,
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(budget) => true,
        };

        token.cancel();
        match tokio::time::timeout(grace, &mut work).await {
            Ok(Err(e)) if !e.is_cancelled() => Err(e),
            Ok(_) => Err(scope_error(timed_out, budget)),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Request did not wind down in time");
                Err(scope_error(timed_out, budget))
            }
        }
    }
}

fn scope_error(timed_out: bool, budget: Duration) -> RagoError {
    if timed_out {
        RagoError::transient(format!("request timed out after {}s", budget.as_secs()))
            .at(Component::Orchestrator, "request")
    } else {
        RagoError::cancelled().at(Component::Orchestrator, "request")
    }
}

impl std::fmt::Debug for Rago {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rago")
            .field("mode", &self.config.mode)
            .field("llm", &self.pillars.llm.is_some())
            .field("rag", &self.pillars.rag.is_some())
            .field("tools", &self.pillars.tools.is_some())
            .field("agents", &self.pillars.agents.is_some())
            .finish()
    }
}
