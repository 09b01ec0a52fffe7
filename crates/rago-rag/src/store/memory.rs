//! In-memory index implementations
//!
//! Each store holds its records behind one `parking_lot::RwLock`; an upsert
//! batch is applied under a single write guard so readers observe either all
//! of a batch or none of it. Queries are brute force.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rago_core::{
    cosine_similarity, Chunk, Component, ErrorKind, RagoError, RagoResult, SearchFilter,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{sort_candidates, ChunkCandidate, KeywordStore, StoreStats, VectorStore};
use crate::hash::tokenize;

/// Parent document to chunk ids
type DocumentIndex = HashMap<String, BTreeSet<String>>;

fn link(index: &mut DocumentIndex, chunk: &Chunk) {
    index
        .entry(chunk.document_id.clone())
        .or_default()
        .insert(chunk.id.clone());
}

fn unlink(index: &mut DocumentIndex, document_id: &str, chunk_id: &str) {
    if let Some(ids) = index.get_mut(document_id) {
        ids.remove(chunk_id);
        if ids.is_empty() {
            index.remove(document_id);
        }
    }
}

fn candidate(chunk: &Chunk, score: f32) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: chunk.id.clone(),
        document_id: chunk.document_id.clone(),
        content: chunk.content.clone(),
        metadata: chunk.metadata.clone(),
        score,
    }
}

// ============================================================================
// Vector store
// ============================================================================

#[derive(Default)]
struct VectorIndex {
    dimension: Option<usize>,
    chunks: BTreeMap<String, Chunk>,
    documents: DocumentIndex,
    last_optimized: Option<chrono::DateTime<Utc>>,
}

/// Cosine-similarity store
#[derive(Default)]
pub struct MemoryVectorStore {
    index: RwLock<VectorIndex>,
}

impl MemoryVectorStore {
    /// Dimension is established by the first upsert
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            index: RwLock::new(VectorIndex {
                dimension: Some(dimension),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn dimension(&self) -> Option<usize> {
        self.index.read().dimension
    }

    async fn upsert_chunks(&self, chunks: &[Chunk]) -> RagoResult<()> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };
        let mut index = self.index.write();
        let dimension = index.dimension.unwrap_or(first.vector.len());
        if let Some(bad) = chunks
            .iter()
            .find(|c| c.vector.is_empty() || c.vector.len() != dimension)
        {
            return Err(RagoError::new(
                ErrorKind::EmbeddingDimensionMismatch,
                format!(
                    "chunk '{}' has {} dimensions, store expects {}",
                    bad.id,
                    bad.vector.len(),
                    dimension
                ),
            )
            .at(Component::Rag, "upsert"));
        }
        index.dimension = Some(dimension);
        for chunk in chunks {
            if let Some(previous) = index.chunks.insert(chunk.id.clone(), chunk.clone()) {
                if previous.document_id != chunk.document_id {
                    unlink(&mut index.documents, &previous.document_id, &previous.id);
                }
            }
            link(&mut index.documents, chunk);
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> RagoResult<usize> {
        let mut index = self.index.write();
        let Some(ids) = index.documents.remove(document_id) else {
            return Ok(0);
        };
        for id in &ids {
            index.chunks.remove(id);
        }
        Ok(ids.len())
    }

    async fn vector_query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> RagoResult<Vec<ChunkCandidate>> {
        let index = self.index.read();
        if let Some(dimension) = index.dimension {
            if vector.len() != dimension {
                return Err(RagoError::new(
                    ErrorKind::EmbeddingDimensionMismatch,
                    format!(
                        "query has {} dimensions, store expects {}",
                        vector.len(),
                        dimension
                    ),
                )
                .at(Component::Rag, "vector_query"));
            }
        }
        let mut hits: Vec<ChunkCandidate> = index
            .chunks
            .values()
            .filter(|c| filter.matches(&c.document_id, &c.metadata))
            .map(|c| candidate(c, cosine_similarity(vector, &c.vector)))
            .collect();
        sort_candidates(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn stats(&self) -> RagoResult<StoreStats> {
        let index = self.index.read();
        let storage_size = index
            .chunks
            .values()
            .map(|c| (c.content.len() + c.vector.len() * 4) as u64)
            .sum();
        Ok(StoreStats {
            document_count: index.documents.len(),
            chunk_count: index.chunks.len(),
            storage_size,
            last_optimized: index.last_optimized,
        })
    }

    async fn optimize(&self) -> RagoResult<()> {
        let mut index = self.index.write();
        index.documents.shrink_to_fit();
        index.last_optimized = Some(Utc::now());
        Ok(())
    }
}

// ============================================================================
// Keyword store
// ============================================================================

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

struct Posting {
    chunk: Chunk,
    terms: HashMap<String, u32>,
    length: usize,
}

#[derive(Default)]
struct KeywordIndex {
    postings: BTreeMap<String, Posting>,
    documents: DocumentIndex,
    /// Term to number of chunks containing it
    document_frequency: HashMap<String, usize>,
    total_length: usize,
    last_optimized: Option<chrono::DateTime<Utc>>,
}

impl KeywordIndex {
    fn remove(&mut self, chunk_id: &str) -> Option<Posting> {
        let posting = self.postings.remove(chunk_id)?;
        self.total_length -= posting.length;
        for term in posting.terms.keys() {
            if let Some(count) = self.document_frequency.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.document_frequency.remove(term);
                }
            }
        }
        Some(posting)
    }

    fn insert(&mut self, chunk: &Chunk) {
        if let Some(previous) = self.remove(&chunk.id) {
            unlink(&mut self.documents, &previous.chunk.document_id, &previous.chunk.id);
        }
        let tokens = tokenize(&chunk.content);
        let mut terms: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *terms.entry(token.clone()).or_default() += 1;
        }
        for term in terms.keys() {
            *self.document_frequency.entry(term.clone()).or_default() += 1;
        }
        self.total_length += tokens.len();
        link(&mut self.documents, chunk);
        self.postings.insert(
            chunk.id.clone(),
            Posting {
                chunk: chunk.clone(),
                terms,
                length: tokens.len(),
            },
        );
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.postings.len() as f32;
        let df = self.document_frequency.get(term).copied().unwrap_or(0) as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, posting: &Posting, query_terms: &BTreeSet<String>) -> f32 {
        let average = if self.postings.is_empty() {
            1.0
        } else {
            (self.total_length as f32 / self.postings.len() as f32).max(1.0)
        };
        query_terms
            .iter()
            .filter_map(|term| {
                let tf = *posting.terms.get(term)? as f32;
                let norm = 1.0 - BM25_B + BM25_B * posting.length as f32 / average;
                Some(self.idf(term) * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm))
            })
            .sum()
    }
}

/// BM25 lexical store
#[derive(Default)]
pub struct MemoryKeywordStore {
    index: RwLock<KeywordIndex>,
}

impl MemoryKeywordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeywordStore for MemoryKeywordStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> RagoResult<()> {
        let mut index = self.index.write();
        for chunk in chunks {
            index.insert(chunk);
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> RagoResult<usize> {
        let mut index = self.index.write();
        let Some(ids) = index.documents.remove(document_id) else {
            return Ok(0);
        };
        for id in &ids {
            index.remove(id);
        }
        Ok(ids.len())
    }

    async fn keyword_query(
        &self,
        text: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> RagoResult<Vec<ChunkCandidate>> {
        let query_terms: BTreeSet<String> = tokenize(text).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index.read();
        let mut hits: Vec<ChunkCandidate> = index
            .postings
            .values()
            .filter(|p| filter.matches(&p.chunk.document_id, &p.chunk.metadata))
            .filter_map(|p| {
                let score = index.score(p, &query_terms);
                (score > 0.0).then(|| candidate(&p.chunk, score))
            })
            .collect();
        sort_candidates(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn stats(&self) -> RagoResult<StoreStats> {
        let index = self.index.read();
        let storage_size = index
            .postings
            .values()
            .map(|p| p.chunk.content.len() as u64)
            .sum();
        Ok(StoreStats {
            document_count: index.documents.len(),
            chunk_count: index.postings.len(),
            storage_size,
            last_optimized: index.last_optimized,
        })
    }

    async fn optimize(&self) -> RagoResult<()> {
        let mut index = self.index.write();
        index.document_frequency.shrink_to_fit();
        index.last_optimized = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_core::{chunk_id, Metadata};

    fn chunk(doc: &str, index: usize, content: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: chunk_id(doc, index),
            document_id: doc.to_string(),
            index,
            content: content.to_string(),
            metadata: Metadata::new(),
            vector,
            start: 0,
            end: content.chars().count(),
            hash: String::new(),
        }
    }

    #[tokio::test]
    async fn test_vector_dimension_established_by_first_upsert() {
        let store = MemoryVectorStore::new();
        assert_eq!(store.dimension(), None);
        store
            .upsert_chunks(&[chunk("a", 0, "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.dimension(), Some(2));

        let err = store
            .upsert_chunks(&[
                chunk("b", 0, "y", vec![0.0, 1.0]),
                chunk("b", 1, "z", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingDimensionMismatch);
        // the rejected batch left nothing behind
        assert_eq!(store.stats().await.unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn test_vector_query_orders_and_filters() {
        let store = MemoryVectorStore::with_dimension(2);
        store
            .upsert_chunks(&[
                chunk("a", 0, "east", vec![1.0, 0.0]),
                chunk("b", 0, "north", vec![0.0, 1.0]),
                chunk("c", 0, "northeast", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = store
            .vector_query(&[1.0, 0.0], 10, &SearchFilter::new())
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "a#00000");
        assert_eq!(hits[1].chunk_id, "c#00000");

        let hits = store
            .vector_query(&[1.0, 0.0], 10, &SearchFilter::document("b"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "b");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_delete_cascades() {
        let store = MemoryVectorStore::new();
        let batch = vec![
            chunk("a", 0, "x", vec![1.0, 0.0]),
            chunk("a", 1, "y", vec![0.0, 1.0]),
        ];
        store.upsert_chunks(&batch).await.unwrap();
        store.upsert_chunks(&batch).await.unwrap();
        assert_eq!(store.stats().await.unwrap().chunk_count, 2);

        assert_eq!(store.delete_by_document("a").await.unwrap(), 2);
        assert_eq!(store.delete_by_document("a").await.unwrap(), 0);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.document_count, 0);
    }

    #[tokio::test]
    async fn test_bm25_prefers_term_dense_chunks() {
        let store = MemoryKeywordStore::new();
        store
            .upsert_chunks(&[
                chunk("a", 0, "rust rust rust ownership", vec![]),
                chunk("b", 0, "rust appears once among many other words here", vec![]),
                chunk("c", 0, "nothing relevant", vec![]),
            ])
            .await
            .unwrap();

        let hits = store
            .keyword_query("Rust", 10, &SearchFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "a");
        assert!(hits[0].score > hits[1].score);
        assert!(store
            .keyword_query("?!", 10, &SearchFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_keyword_delete_updates_frequencies() {
        let store = MemoryKeywordStore::new();
        store
            .upsert_chunks(&[chunk("a", 0, "alpha beta", vec![]), chunk("b", 0, "alpha", vec![])])
            .await
            .unwrap();
        store.delete_by_document("a").await.unwrap();

        let hits = store
            .keyword_query("beta", 10, &SearchFilter::new())
            .await
            .unwrap();
        assert!(hits.is_empty());
        let hits = store
            .keyword_query("alpha", 10, &SearchFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.stats().await.unwrap().document_count, 1);
    }
}
