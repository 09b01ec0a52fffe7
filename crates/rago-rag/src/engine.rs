//! Retrieval engine: ingest pipeline and search over the two indexes

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rago_core::{
    CancellationToken, Component, Document, Embedder, ErrorKind, HealthStatus, Metadata,
    RagoError, RagoResult, SearchFilter, SearchResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::batch::BatchEmbedder;
use crate::chunker::Chunker;
use crate::config::RagConfig;
use crate::fusion::{self, FusionParams};
use crate::store::{
    KeywordStore, MemoryKeywordStore, MemoryVectorStore, StoreStats, VectorStore,
};

/// Concurrent documents in `ingest_batch`
const INGEST_BATCH_CONCURRENCY: usize = 4;

/// Query for `search` and `hybrid_search`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub filter: SearchFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_weight: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_weight: Option<f32>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn weights(mut self, vector_weight: f32, keyword_weight: f32) -> Self {
        self.vector_weight = Some(vector_weight);
        self.keyword_weight = Some(keyword_weight);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub document_id: String,
    pub chunk_count: usize,
    /// An earlier version of the document was replaced
    pub replaced: bool,
}

/// Catalog entry for an ingested document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub content_type: String,
    pub metadata: Metadata,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

struct DocumentRecord {
    document: Document,
    chunk_count: usize,
    ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub storage_size: u64,
    pub last_optimized: Option<DateTime<Utc>>,
    pub embedding_model: String,
    pub dimension: usize,
}

/// Held write lock on one document id. The map entry goes away with the
/// last holder.
struct DocumentLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocumentLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct RetrievalEngine {
    config: RagConfig,
    chunker: Chunker,
    embedder: BatchEmbedder,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<dyn KeywordStore>,
    documents: DashMap<String, DocumentRecord>,
    /// Serializes writers per document id
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RetrievalEngine {
    /// Engine over fresh in-memory indexes
    pub fn new(config: RagConfig, embedder: Arc<dyn Embedder>) -> RagoResult<Self> {
        let dimension = embedder.dimension();
        Self::with_stores(
            config,
            embedder,
            Arc::new(MemoryVectorStore::with_dimension(dimension)),
            Arc::new(MemoryKeywordStore::new()),
        )
    }

    pub fn with_stores(
        config: RagConfig,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<dyn KeywordStore>,
    ) -> RagoResult<Self> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking.clone())?;
        let embedder = BatchEmbedder::new(embedder, config.embedding.batch_size);
        let engine = Self {
            config,
            chunker,
            embedder,
            vectors,
            keywords,
            documents: DashMap::new(),
            locks: DashMap::new(),
        };
        engine.check_dimension("init")?;
        info!(
            model = %engine.embedder.model_name(),
            dimension = engine.embedder.dimension(),
            strategy = ?engine.config.chunking.strategy,
            "Retrieval engine ready"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    fn check_dimension(&self, op: &str) -> RagoResult<()> {
        match self.vectors.dimension() {
            Some(expected) if expected != self.embedder.dimension() => Err(RagoError::new(
                ErrorKind::EmbeddingDimensionMismatch,
                format!(
                    "embedding model '{}' produces {} dimensions but the vector store holds {}",
                    self.embedder.model_name(),
                    self.embedder.dimension(),
                    expected
                ),
            )
            .at(Component::Rag, op)),
            _ => Ok(()),
        }
    }

    async fn lock_document(&self, id: &str) -> DocumentLock<'_> {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        DocumentLock {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Drops a document from both indexes, logging rather than failing
    async fn rollback(&self, document_id: &str) {
        if let Err(e) = self.vectors.delete_by_document(document_id).await {
            warn!(document_id, error = %e, "Rollback of vector index failed");
        }
        if let Err(e) = self.keywords.delete_by_document(document_id).await {
            warn!(document_id, error = %e, "Rollback of keyword index failed");
        }
    }

    /// Chunks, embeds and indexes a document
    ///
    /// An existing id is a conflict unless `overwrite` is set, in which case
    /// the previous version is deleted first. A failure after the vector
    /// index accepted the chunks rolls both indexes back and surfaces as
    /// `ingest-partial`.
    pub async fn ingest(
        &self,
        mut doc: Document,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> RagoResult<IngestResult> {
        if doc.id.trim().is_empty() {
            doc.id = uuid::Uuid::new_v4().to_string();
        }
        doc.validate()?;
        self.check_dimension("ingest")?;

        let _lock = self.lock_document(&doc.id).await;

        let replaced = self.documents.contains_key(&doc.id);
        if replaced && !overwrite {
            return Err(RagoError::conflict(format!("document '{}' already exists", doc.id))
                .at(Component::Rag, "ingest"));
        }
        if replaced {
            self.remove_indexed(&doc.id).await?;
        }

        let mut chunks = self.chunker.split(&doc);
        self.embedder.embed_chunks(&mut chunks, cancel).await?;

        if cancel.is_cancelled() {
            return Err(RagoError::cancelled().at(Component::Rag, "ingest"));
        }

        if let Err(e) = self.vectors.upsert_chunks(&chunks).await {
            self.rollback(&doc.id).await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            warn!(document_id = %doc.id, "Ingest cancelled after partial upsert, rolling back");
            self.rollback(&doc.id).await;
            return Err(RagoError::cancelled().at(Component::Rag, "ingest"));
        }
        if let Err(e) = self.keywords.upsert_chunks(&chunks).await {
            warn!(document_id = %doc.id, error = %e, "Keyword upsert failed, rolling back");
            self.rollback(&doc.id).await;
            return Err(RagoError::new(
                ErrorKind::IngestPartial,
                format!("document '{}' was not fully indexed", doc.id),
            )
            .at(Component::Rag, "ingest")
            .with_source(e));
        }

        let chunk_count = chunks.len();
        info!(document_id = %doc.id, chunks = chunk_count, replaced, "Document ingested");
        let document_id = doc.id.clone();
        self.documents.insert(
            document_id.clone(),
            DocumentRecord {
                document: doc,
                chunk_count,
                ingested_at: Utc::now(),
            },
        );
        Ok(IngestResult {
            document_id,
            chunk_count,
            replaced,
        })
    }

    /// Ingests each document independently; results are in input order
    pub async fn ingest_batch(
        &self,
        docs: Vec<Document>,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Vec<RagoResult<IngestResult>> {
        stream::iter(docs)
            .map(|doc| self.ingest(doc, overwrite, cancel))
            .buffered(INGEST_BATCH_CONCURRENCY)
            .collect()
            .await
    }

    async fn remove_indexed(&self, id: &str) -> RagoResult<usize> {
        let removed = self.vectors.delete_by_document(id).await?;
        self.keywords.delete_by_document(id).await?;
        self.documents.remove(id);
        Ok(removed)
    }

    /// Removes a document and every chunk it owns
    pub async fn delete_document(&self, id: &str) -> RagoResult<usize> {
        let _lock = self.lock_document(id).await;
        if !self.documents.contains_key(id) {
            return Err(RagoError::not_found(format!("document '{}' not found", id))
                .at(Component::Rag, "delete"));
        }
        let removed = self.remove_indexed(id).await?;
        info!(document_id = id, chunks = removed, "Document deleted");
        Ok(removed)
    }

    pub fn get_document(&self, id: &str) -> Option<Document> {
        self.documents.get(id).map(|r| r.document.clone())
    }

    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        let mut out: Vec<DocumentSummary> = self
            .documents
            .iter()
            .map(|r| DocumentSummary {
                id: r.document.id.clone(),
                content_type: r.document.content_type.clone(),
                metadata: r.document.metadata.clone(),
                chunk_count: r.chunk_count,
                created_at: r.document.created_at,
                ingested_at: r.ingested_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn resolve_limit(&self, query: &SearchQuery, op: &str) -> RagoResult<usize> {
        if query.text.trim().is_empty() {
            return Err(RagoError::bad_request("query must not be empty").at(Component::Rag, op));
        }
        match query.limit {
            Some(0) => Err(RagoError::bad_request("limit must be positive").at(Component::Rag, op)),
            Some(limit) => Ok(limit.min(self.config.search.max_limit)),
            None => Ok(self.config.search.default_limit),
        }
    }

    /// Dense search; results score at least the threshold, best first
    pub async fn search(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let limit = self.resolve_limit(query, "search")?;
        let threshold = query.threshold.unwrap_or(self.config.search.threshold);
        let vector = self.embedder.embed_query(&query.text, cancel).await?;
        let candidates = self
            .vectors
            .vector_query(&vector, limit, &query.filter)
            .await?;

        let results: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|c| c.score >= threshold)
            .map(|c| SearchResult {
                chunk_id: c.chunk_id,
                document_id: c.document_id,
                content: c.content,
                score: c.score,
                vector_score: Some(c.score),
                keyword_score: None,
                metadata: c.metadata,
            })
            .collect();
        debug!(limit, threshold, hits = results.len(), "Vector search");
        Ok(results)
    }

    /// Dense and lexical search fused into one ranking
    pub async fn hybrid_search(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let limit = self.resolve_limit(query, "hybrid_search")?;
        let vector_weight = query.vector_weight.unwrap_or(self.config.search.vector_weight);
        let keyword_weight = query
            .keyword_weight
            .unwrap_or(self.config.search.keyword_weight);
        fusion::check_weights(vector_weight, keyword_weight)?;

        let vector = self.embedder.embed_query(&query.text, cancel).await?;
        let fetch = limit.saturating_mul(2);
        let (dense, lexical) = tokio::join!(
            self.vectors.vector_query(&vector, fetch, &query.filter),
            self.keywords.keyword_query(&query.text, fetch, &query.filter),
        );
        let (dense, lexical) = (dense?, lexical?);

        let params = FusionParams {
            method: self.config.search.fusion,
            vector_weight,
            keyword_weight,
            rrf_k: self.config.search.rrf_k,
        };
        let mut results = fusion::fuse(&dense, &lexical, params, limit);
        if let Some(threshold) = query.threshold {
            results.retain(|r| r.score >= threshold);
        }
        debug!(
            limit,
            dense = dense.len(),
            lexical = lexical.len(),
            hits = results.len(),
            "Hybrid search"
        );
        Ok(results)
    }

    pub async fn stats(&self) -> RagoResult<EngineStats> {
        let merged: StoreStats = self.vectors.stats().await?.merge(&self.keywords.stats().await?);
        Ok(EngineStats {
            document_count: self.documents.len(),
            chunk_count: merged.chunk_count,
            storage_size: merged.storage_size,
            last_optimized: merged.last_optimized,
            embedding_model: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimension(),
        })
    }

    pub async fn optimize(&self) -> RagoResult<()> {
        self.vectors.optimize().await?;
        self.keywords.optimize().await?;
        info!("Indexes optimized");
        Ok(())
    }

    /// Healthy when both indexes answer
    pub async fn health(&self) -> HealthStatus {
        match (self.vectors.stats().await, self.keywords.stats().await) {
            (Ok(_), Ok(_)) => HealthStatus::Healthy,
            (Ok(_), Err(e)) | (Err(e), Ok(_)) => {
                warn!(error = %e, "Index unavailable");
                HealthStatus::Degraded
            }
            (Err(e), Err(_)) => {
                warn!(error = %e, "Both indexes unavailable");
                HealthStatus::Unhealthy
            }
        }
    }
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("model", &self.embedder.model_name())
            .field("documents", &self.documents.len())
            .finish()
    }
}
