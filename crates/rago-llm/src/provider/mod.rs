//! Provider trait and backend factory

pub mod http;
#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;

use async_trait::async_trait;
use rago_core::{
    CancellationToken, Component, EventSink, GenerationRequest, GenerationResponse,
    ProviderConfig, ProviderType, RagoError, RagoResult, StreamChunk,
};
use std::sync::Arc;
use std::time::Duration;

/// Remote model backend
///
/// `generate` and `stream` honor `request.tools` when present; the
/// `*_with_tools` variants exist so backends that need a different endpoint
/// or payload for tool use can override them.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// Default model
    fn model(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse>;

    /// Writes chunks to `sink` in arrival order; the last one has
    /// `finished = true`. Returns the aggregated response.
    async fn stream(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse>;

    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        self.generate(request, cancel).await
    }

    async fn stream_with_tools(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn EventSink<StreamChunk>,
        cancel: &CancellationToken,
    ) -> RagoResult<GenerationResponse> {
        self.stream(request, sink, cancel).await
    }

    /// Minimal request proving the backend answers
    async fn health_probe(&self, timeout: Duration) -> RagoResult<()> {
        let request = GenerationRequest::from_prompt("ping").with_max_tokens(1);
        let cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, self.generate(&request, &cancel)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(RagoError::transient(format!(
                "health probe timed out after {}ms",
                timeout.as_millis()
            ))
            .at(Component::Llm, "health_probe")),
        }
    }
}

/// Instantiates the backend named by `config.provider_type`
pub fn create_provider(config: ProviderConfig) -> RagoResult<Arc<dyn Provider>> {
    config.validate()?;
    match config.provider_type {
        #[cfg(feature = "openai")]
        ProviderType::Openai | ProviderType::Lmstudio => {
            Ok(Arc::new(openai::OpenAiProvider::new(config)?))
        }
        #[cfg(feature = "ollama")]
        ProviderType::Ollama => Ok(Arc::new(ollama::OllamaProvider::new(config)?)),
        #[allow(unreachable_patterns)]
        other => Err(RagoError::config(format!(
            "provider '{}': backend '{}' is not compiled in",
            config.name, other
        ))
        .at(Component::Llm, "create_provider")),
    }
}
