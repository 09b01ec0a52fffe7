//! Registry configuration (`[llm]` section)

use rago_core::{Component, ProviderConfig, RagoError, RagoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::selection::LoadBalancingPolicy;

fn default_max_retries() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout_secs() -> u64 {
    30
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_batch_concurrency() -> usize {
    4
}

/// Selection, failover and probing knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub policy: LoadBalancingPolicy,
    /// Extra attempts on other providers after a retryable failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_timeout_secs")]
    pub circuit_breaker_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Parallel requests issued by `batch`
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            policy: LoadBalancingPolicy::default(),
            max_retries: default_max_retries(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_timeout_secs: default_breaker_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl RegistryConfig {
    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

fn default_enabled() -> bool {
    true
}

/// `[llm]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(flatten)]
    pub registry: RegistryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: Vec::new(),
            registry: RegistryConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> RagoResult<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(RagoError::config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                ))
                .at(Component::Config, "validate"));
            }
        }
        if self.registry.circuit_breaker_threshold == 0 {
            return Err(RagoError::config("circuit_breaker_threshold must be positive")
                .at(Component::Config, "validate"));
        }
        Ok(())
    }
}
