//! RAGO Runtime - Orchestrator over the four pillars
//!
//! [`Rago`] owns a provider registry (generation), a retrieval engine, a tool
//! host and a workflow engine, and is the only place where they are
//! composed. High-level calls take a request-scoped [`CancellationToken`]
//! that reaches every downstream call.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rago_core::{CancellationToken, ChatRequest};
//! use rago_runtime::{init_tracing, Rago, RagoConfig};
//!
//! # async fn example() -> rago_core::RagoResult<()> {
//! let config = RagoConfig::load(None)?;
//! init_tracing(&config.log_level);
//!
//! let rago = Rago::new(config).await?;
//! rago.start().await?;
//!
//! let response = rago
//!     .chat(ChatRequest::new("What changed in the last release?").with_rag(), &CancellationToken::new())
//!     .await?;
//! println!("{}", response.content);
//!
//! rago.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod chat;
pub mod client;
pub mod config;
mod document;
pub mod health;
mod task;
pub mod telemetry;

pub use client::{Rago, RagoBuilder};
pub use config::{HealthConfig, OrchestratorConfig, RagoConfig, RunMode};
pub use document::ENTITY_EXTRACTION_TOOL;
pub use health::HealthMonitor;
pub use telemetry::init_tracing;

pub use rago_core::CancellationToken;
