//! Retrieval configuration (`[rag]` section)

use rago_core::{Component, RagoError, RagoResult};
use serde::{Deserialize, Serialize};

use crate::chunker::ChunkingStrategy;
use crate::fusion::FusionMethod;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Maximum characters per chunk
    pub chunk_size: usize,
    /// Characters shared by adjacent chunks (recursive strategy only)
    pub chunk_overlap: usize,
    /// Smaller chunks are dropped unless they are a document's only chunk
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Recursive,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 50,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> RagoResult<()> {
        if self.chunk_size == 0 {
            return Err(RagoError::config("chunk_size must be positive")
                .at(Component::Config, "validate"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagoError::config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            ))
            .at(Component::Config, "validate"));
        }
        Ok(())
    }
}

/// Embedding backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Offline feature-hashing embedder
    #[default]
    Hash,
    Openai,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    #[serde(rename = "type")]
    pub backend: EmbeddingBackend,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub dimension: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            model: "hash-384".to_string(),
            endpoint: None,
            api_key: None,
            dimension: 384,
            batch_size: 32,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub threshold: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub fusion: FusionMethod,
    /// Rank offset for reciprocal-rank fusion
    pub rrf_k: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: rago_core::DEFAULT_SEARCH_LIMIT,
            max_limit: rago_core::MAX_SEARCH_LIMIT,
            threshold: rago_core::DEFAULT_SEARCH_THRESHOLD,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            fusion: FusionMethod::MinMax,
            rrf_k: 60.0,
        }
    }
}

/// `[rag]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl RagConfig {
    pub fn validate(&self) -> RagoResult<()> {
        self.chunking.validate()?;
        if self.embedding.dimension == 0 {
            return Err(RagoError::config("embedding dimension must be positive")
                .at(Component::Config, "validate"));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagoError::config("embedding batch_size must be positive")
                .at(Component::Config, "validate"));
        }
        crate::fusion::check_weights(self.search.vector_weight, self.search.keyword_weight)
            .map_err(|e| RagoError::config(e.message()).at(Component::Config, "validate"))?;
        if self.search.max_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(RagoError::config("search default_limit must not exceed max_limit")
                .at(Component::Config, "validate"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: RagConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.chunking.chunk_size, 1000);
        assert_eq!(cfg.chunking.min_chunk_size, 50);
        assert_eq!(cfg.embedding.batch_size, 32);
        assert_eq!(cfg.search.fusion, FusionMethod::MinMax);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut cfg = RagConfig::default();
        cfg.search.vector_weight = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let mut cfg = RagConfig::default();
        cfg.chunking.chunk_overlap = 1000;
        assert!(cfg.validate().is_err());
    }
}
