//! Batched embedding of chunk contents

use rago_core::{CancellationToken, Chunk, Component, Embedder, ErrorKind, RagoError, RagoResult};
use std::sync::Arc;
use tracing::debug;

pub struct BatchEmbedder {
    inner: Arc<dyn Embedder>,
    batch_size: usize,
}

impl BatchEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn check(&self, vectors: &[Vec<f32>], expected: usize, op: &str) -> RagoResult<()> {
        if vectors.len() != expected {
            return Err(RagoError::internal(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                expected
            ))
            .at(Component::Rag, op));
        }
        let dimension = self.inner.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagoError::new(
                ErrorKind::EmbeddingDimensionMismatch,
                format!(
                    "model '{}' produced {} dimensions, expected {}",
                    self.inner.model_name(),
                    bad.len(),
                    dimension
                ),
            )
            .at(Component::Rag, op));
        }
        Ok(())
    }

    /// Fills in `vector` for every chunk, `batch_size` texts per call
    pub async fn embed_chunks(
        &self,
        chunks: &mut [Chunk],
        cancel: &CancellationToken,
    ) -> RagoResult<()> {
        for batch in chunks.chunks_mut(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(RagoError::cancelled().at(Component::Rag, "embed"));
            }
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            debug!(model = %self.inner.model_name(), count = texts.len(), "Embedding chunk batch");
            let vectors = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RagoError::cancelled().at(Component::Rag, "embed"));
                }
                result = self.inner.embed(&texts, cancel) => result?,
            };
            self.check(&vectors, texts.len(), "embed")?;
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.vector = vector;
            }
        }
        Ok(())
    }

    pub async fn embed_query(&self, query: &str, cancel: &CancellationToken) -> RagoResult<Vec<f32>> {
        let texts = [query.to_string()];
        let vectors = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RagoError::cancelled().at(Component::Rag, "search"));
            }
            result = self.inner.embed(&texts, cancel) => result?,
        };
        self.check(&vectors, 1, "search")?;
        Ok(vectors.into_iter().next().unwrap_or_default())
    }
}
