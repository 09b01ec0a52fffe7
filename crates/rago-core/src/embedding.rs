//! Embedding trait and vector utilities
//!
//! Concrete embedders live with the crates that own their transport: HTTP
//! backends in `rago-llm`, the offline hash embedder in `rago-rag`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RagoResult;

/// Embedding backend
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`)
    fn model_name(&self) -> &str;

    /// Vector dimensionality produced by this model
    fn dimension(&self) -> usize;

    /// Embed a batch of texts; the output is in input order
    async fn embed(&self, texts: &[String], cancel: &CancellationToken)
        -> RagoResult<Vec<Vec<f32>>>;
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Scale a vector to unit length in place (zero vectors are left alone)
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
