//! Offline feature-hashing embedder
//!
//! Each lowercase alphanumeric token is hashed (64-bit FNV-1a) into one of
//! `dimension` buckets with a sign taken from the top bit, and the resulting
//! bag-of-words vector is L2-normalized. No network, fully deterministic.

use async_trait::async_trait;
use rago_core::{l2_normalize, CancellationToken, Component, Embedder, RagoError, RagoResult};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Lowercase alphanumeric tokens; shared with the keyword index
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> RagoResult<Self> {
        if dimension == 0 {
            return Err(RagoError::config("embedding dimension must be positive")
                .at(Component::Config, "embedder"));
        }
        Ok(Self {
            model: format!("hash-{}", dimension),
            dimension,
        })
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(&token);
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<Vec<f32>>> {
        if cancel.is_cancelled() {
            return Err(RagoError::cancelled().at(Component::Rag, "embed"));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_core::cosine_similarity;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Which city is the capital of France?"),
            vec!["which", "city", "is", "the", "capital", "of", "france"]
        );
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_related_sentences_are_close() {
        let e = HashEmbedder::new(384).unwrap();
        let doc = e.embed_one("The capital of France is Paris.");
        let query = e.embed_one("Which city is the capital of France?");
        let other = e.embed_one("Rust is a systems programming language");
        assert!(cosine_similarity(&doc, &query) >= 0.7);
        assert!(cosine_similarity(&other, &query) < 0.5);
    }

    #[test]
    fn test_unit_length_and_deterministic() {
        let e = HashEmbedder::new(64).unwrap();
        let a = e.embed_one("hello world");
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(a, e.embed_one("Hello, WORLD!"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let e = HashEmbedder::new(8).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = e.embed(&["x".to_string()], &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
