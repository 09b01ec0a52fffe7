//! HTTP embedding backends
//!
//! Two wire shapes are supported: chat-completions style `POST /embeddings`
//! and the local inference server's `POST /api/embed`. Both return one vector
//! per input in input order.

use async_trait::async_trait;
use rago_core::{
    CancellationToken, Component, Embedder, ErrorKind, ProviderType, RagoError, RagoResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::provider::http;

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for an HTTP embedder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEmbedderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub dimension: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpEmbedderConfig {
    pub fn new(provider_type: ProviderType, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            provider_type,
            model: model.into(),
            endpoint: None,
            api_key: None,
            dimension,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.provider_type.default_endpoint())
    }
}

pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> RagoResult<Self> {
        if config.dimension == 0 {
            return Err(RagoError::config("embedding dimension must be positive")
                .at(Component::Config, "embedder"));
        }
        let client = http::build_client(Duration::from_secs(config.timeout_secs.max(1)))?;
        Ok(Self { config, client })
    }

    fn request(&self, texts: &[String]) -> reqwest::RequestBuilder {
        let base = self.config.endpoint().trim_end_matches('/');
        let builder = match self.config.provider_type {
            ProviderType::Ollama => self
                .client
                .post(format!("{}/api/embed", base))
                .json(&json!({"model": self.config.model, "input": texts})),
            ProviderType::Openai | ProviderType::Lmstudio => self
                .client
                .post(format!("{}/embeddings", base))
                .json(&json!({"model": self.config.model, "input": texts})),
        };
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Pulls vectors out of either response shape
pub(crate) fn parse_embeddings(body: &Value) -> RagoResult<Vec<Vec<f32>>> {
    let to_vec = |v: &Value| -> Option<Vec<f32>> {
        v.as_array()
            .map(|xs| xs.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
    };

    if let Some(data) = body.get("data").and_then(|d| d.as_array()) {
        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| {
                let index = item
                    .get("index")
                    .and_then(|i| i.as_u64())
                    .map(|i| i as usize)
                    .unwrap_or(pos);
                item.get("embedding").and_then(to_vec).map(|v| (index, v))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        return Ok(indexed.into_iter().map(|(_, v)| v).collect());
    }

    if let Some(rows) = body.get("embeddings").and_then(|e| e.as_array()) {
        return Ok(rows.iter().filter_map(to_vec).collect());
    }

    Err(RagoError::internal("embedding response carries no vectors").at(Component::Rag, "embed"))
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.config.model, count = texts.len(), "Embedding batch");
        let body = http::send_json(self.request(texts), cancel, "embed")
            .await
            .map_err(|e| e.at(Component::Rag, "embed"))?;
        let vectors = parse_embeddings(&body)?;

        if vectors.len() != texts.len() {
            return Err(RagoError::internal(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ))
            .at(Component::Rag, "embed"));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.config.dimension) {
            return Err(RagoError::new(
                ErrorKind::EmbeddingDimensionMismatch,
                format!(
                    "model '{}' produced {} dimensions, expected {}",
                    self.config.model,
                    bad.len(),
                    self.config.dimension
                ),
            )
            .at(Component::Rag, "embed"));
        }
        Ok(vectors)
    }
}
