//! RAGO LLM - Provider registry for the generation pillar
//!
//! Owns provider handles, tracks their health, and selects one per request
//! under a load-balancing policy with failover and per-provider circuit
//! breaking.
//!
//! ## Backends
//!
//! - **openai**: chat-completions JSON with server-sent event streaming
//! - **lmstudio**: the same wire shape against a local server, no API key
//! - **ollama**: local inference server with NDJSON streaming
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rago_core::{CancellationToken, GenerationRequest, ProviderConfig, ProviderType};
//! use rago_llm::{ProviderRegistry, RegistryConfig};
//!
//! # async fn example() -> rago_core::RagoResult<()> {
//! let registry = ProviderRegistry::new(RegistryConfig::default());
//! registry.add_provider(ProviderConfig::new("local", ProviderType::Ollama, "llama3.2"))?;
//!
//! let response = registry
//!     .generate(&GenerationRequest::from_prompt("Hello"), &CancellationToken::new())
//!     .await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod embedding;
pub mod probe;
pub mod provider;
pub mod registry;
pub mod selection;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{LlmConfig, RegistryConfig};
pub use embedding::{HttpEmbedder, HttpEmbedderConfig};
pub use provider::{create_provider, Provider};
pub use registry::{ProviderInfo, ProviderRegistry, ProviderStats};
pub use selection::LoadBalancingPolicy;
