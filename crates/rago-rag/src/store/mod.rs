//! Index storage abstraction
//!
//! The engine writes every chunk to two indexes: a [`VectorStore`] for dense
//! similarity and a [`KeywordStore`] for lexical scoring. Both are opaque to
//! the engine beyond the operations below.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | `upsert_chunks` | Insert or replace chunks by id, atomically per call |
//! | `delete_by_document` | Drop every chunk of a document |
//! | `vector_query` / `keyword_query` | Top candidates under a filter |
//! | `stats` | Counts and approximate size |
//! | `optimize` | Implementation-defined maintenance |
//!
//! Implementations must be `Send + Sync`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rago_core::{Chunk, Metadata, RagoResult, SearchFilter};
use serde::{Deserialize, Serialize};

pub use memory::{MemoryKeywordStore, MemoryVectorStore};

/// Candidate chunk returned by either index
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Raw backend score (cosine similarity or BM25)
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
    /// Approximate bytes held
    pub storage_size: u64,
    pub last_optimized: Option<DateTime<Utc>>,
}

impl StoreStats {
    /// Combines two stores' stats; counts take the larger side
    pub fn merge(&self, other: &StoreStats) -> StoreStats {
        StoreStats {
            document_count: self.document_count.max(other.document_count),
            chunk_count: self.chunk_count.max(other.chunk_count),
            storage_size: self.storage_size + other.storage_size,
            last_optimized: match (self.last_optimized, other.last_optimized) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            },
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Established vector dimension, if any
    fn dimension(&self) -> Option<usize>;

    /// Idempotent on chunk id; all or none of `chunks` become visible
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> RagoResult<()>;

    /// Returns the number of chunks removed
    async fn delete_by_document(&self, document_id: &str) -> RagoResult<usize>;

    async fn vector_query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> RagoResult<Vec<ChunkCandidate>>;

    async fn stats(&self) -> RagoResult<StoreStats>;

    async fn optimize(&self) -> RagoResult<()>;
}

#[async_trait]
pub trait KeywordStore: Send + Sync {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> RagoResult<()>;

    async fn delete_by_document(&self, document_id: &str) -> RagoResult<usize>;

    async fn keyword_query(
        &self,
        text: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> RagoResult<Vec<ChunkCandidate>>;

    async fn stats(&self) -> RagoResult<StoreStats>;

    async fn optimize(&self) -> RagoResult<()>;
}

/// Orders candidates by score descending, then chunk id ascending
pub(crate) fn sort_candidates(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
