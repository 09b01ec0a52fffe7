//! Retrieval Engine Integration Tests
//!
//! Ingest, search, hybrid fusion, cascade delete and rollback behavior
//! against the in-memory indexes and the offline hash embedder.

use async_trait::async_trait;
use rago_core::{
    CancellationToken, Chunk, Document, ErrorKind, RagoError, RagoResult, SearchFilter,
};
use rago_rag::{
    ChunkCandidate, ChunkingStrategy, HashEmbedder, KeywordStore, MemoryVectorStore, RagConfig,
    RetrievalEngine, SearchQuery, StoreStats, VectorStore,
};
use std::sync::Arc;

fn engine_with(config: RagConfig) -> RetrievalEngine {
    let embedder = Arc::new(HashEmbedder::new(config.embedding.dimension).unwrap());
    RetrievalEngine::new(config, embedder).unwrap()
}

fn engine() -> RetrievalEngine {
    engine_with(RagConfig::default())
}

fn small_chunks() -> RagConfig {
    let mut config = RagConfig::default();
    config.chunking.chunk_size = 200;
    config.chunking.chunk_overlap = 40;
    config.chunking.min_chunk_size = 10;
    config
}

const TOPICS: [&str; 5] = ["astronomy", "cooking", "gardening", "networking", "sailing"];

fn corpus() -> Vec<Document> {
    (0..10)
        .map(|i| {
            let topic = TOPICS[i % TOPICS.len()];
            Document::new(
                format!("doc-{}", i),
                format!(
                    "Document {} is a short note about {}. Readers interested in {} \
                     will find practical tips and a few historical remarks here.",
                    i, topic, topic
                ),
            )
            .with_metadata("topic", topic)
        })
        .collect()
}

// ============================================================================
// Ingest and Dense Search
// ============================================================================

#[tokio::test]
async fn test_rag_augmented_lookup() {
    let engine = engine();
    let cancel = CancellationToken::new();
    let result = engine
        .ingest(
            Document::new("d1", "The capital of France is Paris."),
            false,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(result.chunk_count, 1);
    assert!(!result.replaced);

    let hits = engine
        .search(&SearchQuery::new("Which city is the capital of France?"), &cancel)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].document_id, "d1");
    assert!(hits[0].score >= 0.7);
    assert!(hits[0].content.contains("Paris"));
}

#[tokio::test]
async fn test_threshold_filters_weak_matches() {
    let engine = engine();
    let cancel = CancellationToken::new();
    engine
        .ingest(Document::new("d1", "The capital of France is Paris."), false, &cancel)
        .await
        .unwrap();

    let hits = engine
        .search(&SearchQuery::new("sailing knots and rigging"), &cancel)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_anonymous_document_gets_id() {
    let engine = engine();
    let result = engine
        .ingest(
            Document::anonymous("Some content without an id of its own."),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!result.document_id.is_empty());
    assert!(engine.get_document(&result.document_id).is_some());
}

#[tokio::test]
async fn test_empty_document_rejected() {
    let engine = engine();
    let err = engine
        .ingest(Document::new("d1", "   "), false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(engine.document_count(), 0);
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let engine = engine();
    let err = engine
        .search(&SearchQuery::new(""), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), "bad-request");
}

#[tokio::test]
async fn test_metadata_filter() {
    let engine = engine();
    let cancel = CancellationToken::new();
    for doc in corpus() {
        engine.ingest(doc, false, &cancel).await.unwrap();
    }

    let query = SearchQuery::new("practical tips")
        .threshold(-1.0)
        .filter(SearchFilter::new().with_metadata("topic", "cooking"));
    let hits = engine.search(&query, &cancel).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.metadata["topic"] == "cooking"));
}

// ============================================================================
// Hybrid Search
// ============================================================================

#[tokio::test]
async fn test_hybrid_search_over_ten_documents() {
    let engine = engine();
    let cancel = CancellationToken::new();
    for doc in corpus() {
        engine.ingest(doc, false, &cancel).await.unwrap();
    }

    let query = SearchQuery::new("tips about gardening").limit(5).weights(0.5, 0.5);
    let hits = engine.hybrid_search(&query, &cancel).await.unwrap();

    assert_eq!(hits.len(), 5);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    assert_eq!(hits[0].metadata["topic"], "gardening");
}

#[tokio::test]
async fn test_hybrid_weights_must_sum_to_one() {
    let engine = engine();
    let query = SearchQuery::new("anything").weights(0.6, 0.6);
    let err = engine
        .hybrid_search(&query, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn test_quoted_phrase_is_found() {
    let engine = engine_with(small_chunks());
    let cancel = CancellationToken::new();
    let body = (0..30)
        .map(|i| format!("Line {} covers routine maintenance of item {}.", i, i))
        .chain(std::iter::once(
            "The lighthouse keeper polished the brass lens every evening.".to_string(),
        ))
        .collect::<Vec<_>>()
        .join("\n");
    engine
        .ingest(Document::new("manual", body), false, &cancel)
        .await
        .unwrap();

    let phrase = "lighthouse keeper polished the brass lens";
    let hits = engine
        .hybrid_search(&SearchQuery::new(phrase).limit(3), &cancel)
        .await
        .unwrap();
    assert!(hits[0].content.contains(phrase));
}

// ============================================================================
// Overwrite and Delete
// ============================================================================

#[tokio::test]
async fn test_duplicate_requires_overwrite() {
    let engine = engine_with(small_chunks());
    let cancel = CancellationToken::new();
    let doc = corpus().remove(0);

    let first = engine.ingest(doc.clone(), false, &cancel).await.unwrap();
    let err = engine.ingest(doc.clone(), false, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let second = engine.ingest(doc, true, &cancel).await.unwrap();
    assert!(second.replaced);
    assert_eq!(second.chunk_count, first.chunk_count);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.chunk_count, first.chunk_count);
}

#[tokio::test]
async fn test_delete_cascades_to_both_indexes() {
    let engine = engine();
    let cancel = CancellationToken::new();
    for doc in corpus() {
        engine.ingest(doc, false, &cancel).await.unwrap();
    }

    let removed = engine.delete_document("doc-2").await.unwrap();
    assert!(removed >= 1);
    assert!(engine.get_document("doc-2").is_none());

    let dense = engine
        .search(&SearchQuery::new("gardening").threshold(-1.0).limit(100), &cancel)
        .await
        .unwrap();
    assert!(dense.iter().all(|h| h.document_id != "doc-2"));

    let fused = engine
        .hybrid_search(&SearchQuery::new("gardening").limit(100), &cancel)
        .await
        .unwrap();
    assert!(fused.iter().all(|h| h.document_id != "doc-2"));

    let err = engine.delete_document("doc-2").await.unwrap_err();
    assert_eq!(err.status(), "not-found");
}

#[tokio::test]
async fn test_list_documents_sorted() {
    let engine = engine();
    let cancel = CancellationToken::new();
    let results = engine.ingest_batch(corpus(), false, &cancel).await;
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.is_ok()));

    let listed = engine.list_documents();
    assert_eq!(listed.len(), 10);
    assert_eq!(listed[0].id, "doc-0");
    assert!(listed.iter().all(|d| d.chunk_count >= 1));
}

#[tokio::test]
async fn test_ingest_batch_reports_per_item() {
    let engine = engine();
    let docs = vec![
        Document::new("a", "A perfectly reasonable document."),
        Document::new("b", ""),
        Document::new("c", "Another perfectly reasonable document."),
    ];
    let results = engine
        .ingest_batch(docs, false, &CancellationToken::new())
        .await;
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::BadRequest);
    assert_eq!(results[2].as_ref().unwrap().document_id, "c");
}

// ============================================================================
// Failure Handling
// ============================================================================

struct BrokenKeywordStore;

#[async_trait]
impl KeywordStore for BrokenKeywordStore {
    async fn upsert_chunks(&self, _chunks: &[Chunk]) -> RagoResult<()> {
        Err(RagoError::transient("keyword index offline"))
    }

    async fn delete_by_document(&self, _document_id: &str) -> RagoResult<usize> {
        Ok(0)
    }

    async fn keyword_query(
        &self,
        _text: &str,
        _limit: usize,
        _filter: &SearchFilter,
    ) -> RagoResult<Vec<ChunkCandidate>> {
        Ok(Vec::new())
    }

    async fn stats(&self) -> RagoResult<StoreStats> {
        Err(RagoError::transient("keyword index offline"))
    }

    async fn optimize(&self) -> RagoResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_partial_ingest_rolls_back() {
    let vectors = Arc::new(MemoryVectorStore::new());
    let engine = RetrievalEngine::with_stores(
        RagConfig::default(),
        Arc::new(HashEmbedder::new(384).unwrap()),
        vectors.clone(),
        Arc::new(BrokenKeywordStore),
    )
    .unwrap();

    let err = engine
        .ingest(
            Document::new("d1", "The capital of France is Paris."),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IngestPartial);
    assert!(err.to_json()["cause"].as_str().unwrap().contains("offline"));

    assert_eq!(vectors.stats().await.unwrap().chunk_count, 0);
    assert!(engine.get_document("d1").is_none());
    assert_eq!(engine.health().await, rago_core::HealthStatus::Degraded);
}

#[tokio::test]
async fn test_dimension_mismatch_blocks_engine() {
    let err = RetrievalEngine::with_stores(
        RagConfig::default(),
        Arc::new(HashEmbedder::new(16).unwrap()),
        Arc::new(MemoryVectorStore::with_dimension(8)),
        Arc::new(rago_rag::MemoryKeywordStore::new()),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmbeddingDimensionMismatch);
}

#[tokio::test]
async fn test_cancelled_ingest_leaves_nothing() {
    let engine = engine();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .ingest(Document::new("d1", "Some text worth indexing."), false, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(engine.stats().await.unwrap().chunk_count, 0);
}

#[tokio::test]
async fn test_semantic_strategy_end_to_end() {
    let mut config = small_chunks();
    config.chunking.strategy = ChunkingStrategy::Semantic;
    config.chunking.chunk_overlap = 0;
    let engine = engine_with(config);
    let body = corpus()
        .into_iter()
        .map(|d| d.content)
        .collect::<Vec<_>>()
        .join(" ");
    let result = engine
        .ingest(Document::new("all", body), false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.chunk_count > 1);
}
