//! Provider configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Component, RagoError, RagoResult};

/// Supported backend shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Chat-completions JSON POST with server-sent event streaming
    Openai,
    /// Local inference server with NDJSON streaming
    Ollama,
    /// OpenAI-compatible local server without authentication
    Lmstudio,
}

impl ProviderType {
    pub const ALL: [ProviderType; 3] = [ProviderType::Openai, ProviderType::Ollama, ProviderType::Lmstudio];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Openai => "openai",
            ProviderType::Ollama => "ollama",
            ProviderType::Lmstudio => "lmstudio",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderType::Openai => "https://api.openai.com/v1",
            ProviderType::Ollama => "http://localhost:11434",
            ProviderType::Lmstudio => "http://localhost:1234/v1",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = RagoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                RagoError::config(format!(
                    "unknown provider type '{}' (expected one of: openai, ollama, lmstudio)",
                    s
                ))
            })
    }
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

/// Provider entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Base URL; defaults per provider type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: String,
    /// Extra models this provider serves (pinning matches these too)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, provider_type: ProviderType, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type,
            endpoint: None,
            model: model.into(),
            models: Vec::new(),
            api_key: None,
            weight: default_weight(),
            enabled: true,
            timeout_secs: default_timeout_secs(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.provider_type.default_endpoint())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True if this provider advertises `model`
    pub fn serves(&self, model: &str) -> bool {
        self.model == model || self.models.iter().any(|m| m == model)
    }

    pub fn validate(&self) -> RagoResult<()> {
        if self.name.trim().is_empty() {
            return Err(RagoError::config("provider name must not be empty")
                .at(Component::Config, "validate"));
        }
        if self.timeout_secs == 0 {
            return Err(RagoError::config(format!(
                "provider '{}': timeout_secs must be positive",
                self.name
            ))
            .at(Component::Config, "validate"));
        }
        Ok(())
    }
}
