//! Client configuration (`rago.toml`)
//!
//! Every section has defaults, so an empty file is a complete configuration.
//! Files are looked up in this order, first hit wins:
//!
//! 1. an explicit path (must exist)
//! 2. `./rago.toml`
//! 3. `./.rago/rago.toml`
//! 4. `$HOME/.rago/rago.toml`

use rago_agents::AgentsConfig;
use rago_core::{Component, Pillar, ProviderType, RagoError, RagoResult, ToolSelection};
use rago_llm::LlmConfig;
use rago_mcp::McpConfig;
use rago_rag::RagConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const FILE_NAME: &str = "rago.toml";
const DIR_NAME: &str = ".rago";

/// Preset that switches off the pillars a deployment does not use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    /// Generation only
    LlmOnly,
    /// Generation plus retrieval
    RagOnly,
}

impl RunMode {
    pub fn allows(&self, pillar: Pillar) -> bool {
        match self {
            RunMode::Full => true,
            RunMode::LlmOnly => pillar == Pillar::Llm,
            RunMode::RagOnly => matches!(pillar, Pillar::Llm | Pillar::Rag),
        }
    }
}

/// `[orchestrator]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tool calls one chat request may make
    pub max_tool_calls: usize,
    pub rag_limit: usize,
    pub rag_threshold: f32,
    pub tool_selection: ToolSelection,
    pub request_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            rag_limit: 5,
            rag_threshold: rago_core::DEFAULT_SEARCH_THRESHOLD,
            tool_selection: ToolSelection::Catalog,
            request_timeout_secs: 120,
        }
    }
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 30,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagoConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub mode: RunMode,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub mcp: McpConfig,
    pub agents: AgentsConfig,
    pub orchestrator: OrchestratorConfig,
    pub health: HealthConfig,
}

impl Default for RagoConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DIR_NAME).join("data"),
            log_level: "info".to_string(),
            mode: RunMode::Full,
            llm: LlmConfig::default(),
            rag: RagConfig::default(),
            mcp: McpConfig::default(),
            agents: AgentsConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

fn config_error(message: impl Into<String>) -> RagoError {
    RagoError::config(message).at(Component::Config, "load")
}

impl RagoConfig {
    /// Resolves, reads and validates the configuration; built-in defaults
    /// when no file is found
    pub fn load(explicit: Option<&Path>) -> RagoResult<Self> {
        let cwd = std::env::current_dir()?;
        let home = dirs::home_dir();
        match resolve_path(explicit, &cwd, home.as_deref())? {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No configuration file found, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_file(path: &Path) -> RagoResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!("cannot read {}: {}", path.display(), e)).with_source(e)
        })?;
        let config = Self::from_toml_str(&content, &path.display().to_string())?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parses and validates TOML text; `origin` names the source in errors
    pub fn from_toml_str(content: &str, origin: &str) -> RagoResult<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| config_error(format!("{}: {}", origin, e)).with_source(e))?;
        check_provider_types(&table).map_err(|e| config_error(format!("{}: {}", origin, e.message())))?;

        let config: Self = serde_path_to_error::deserialize(toml::Deserializer::new(content))
            .map_err(|e| {
                let path = e.path().to_string();
                let inner = e.into_inner();
                config_error(format!("{}: {} (at {})", origin, inner, path)).with_source(inner)
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> RagoResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            RagoError::internal(format!("cannot render configuration: {}", e))
                .at(Component::Config, "render")
        })
    }

    /// Whether a pillar is switched on by both its section and the mode
    pub fn pillar_enabled(&self, pillar: Pillar) -> bool {
        let section = match pillar {
            Pillar::Llm => self.llm.enabled,
            Pillar::Rag => self.rag.enabled,
            Pillar::Tools => self.mcp.enabled,
            Pillar::Agents => self.agents.enabled,
        };
        section && self.mode.allows(pillar)
    }

    /// Directory of the file-backed workflow state store
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn validate(&self) -> RagoResult<()> {
        self.llm.validate()?;
        self.rag.validate()?;
        self.mcp.validate()?;
        self.agents.validate()?;
        if !(0.0..=1.0).contains(&self.orchestrator.rag_threshold) {
            return Err(RagoError::config("orchestrator rag_threshold must be within [0, 1]")
                .at(Component::Config, "validate"));
        }
        if self.orchestrator.rag_limit == 0 {
            return Err(RagoError::config("orchestrator rag_limit must be positive")
                .at(Component::Config, "validate"));
        }
        Ok(())
    }
}

/// Reports an unknown provider `type` by provider name rather than by path
fn check_provider_types(table: &toml::Table) -> RagoResult<()> {
    let providers = table
        .get("llm")
        .and_then(|llm| llm.get("providers"))
        .and_then(|p| p.as_array());
    for provider in providers.into_iter().flatten() {
        let name = provider
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("<unnamed>");
        match provider.get("type").and_then(|t| t.as_str()) {
            Some(kind) => {
                ProviderType::from_str(kind).map_err(|e| {
                    RagoError::config(format!("provider '{}': {}", name, e.message()))
                })?;
            }
            None => {
                return Err(RagoError::config(format!("provider '{}' has no type", name)));
            }
        }
    }
    Ok(())
}

/// Picks the configuration file to read, `None` when there is none
pub fn resolve_path(
    explicit: Option<&Path>,
    cwd: &Path,
    home: Option<&Path>,
) -> RagoResult<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(config_error(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }
    let mut candidates = vec![cwd.join(FILE_NAME), cwd.join(DIR_NAME).join(FILE_NAME)];
    if let Some(home) = home {
        candidates.push(home.join(DIR_NAME).join(FILE_NAME));
    }
    Ok(candidates.into_iter().find(|p| p.is_file()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rago_core::ErrorKind;

    #[test]
    fn test_empty_file_is_default() {
        let config = RagoConfig::from_toml_str("", "test").unwrap();
        assert_eq!(config, RagoConfig::default());
        assert_eq!(config.orchestrator.max_tool_calls, 5);
        assert_eq!(config.health.check_interval_secs, 30);
        assert_eq!(config.data_dir, PathBuf::from(".rago/data"));
    }

    #[test]
    fn test_sections_parse() {
        let toml = r#"
log_level = "debug"
mode = "rag_only"

[llm]
policy = "round_robin"

[[llm.providers]]
name = "local"
type = "ollama"
model = "llama3.2"
weight = 2

[rag.search]
vector_weight = 0.5
keyword_weight = 0.5
fusion = "reciprocal_rank"

[orchestrator]
tool_selection = "heuristic"
max_tool_calls = 3
"#;
        let config = RagoConfig::from_toml_str(toml, "test").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.mode, RunMode::RagOnly);
        assert_eq!(config.llm.providers[0].weight, 2);
        assert_eq!(config.rag.search.vector_weight, 0.5);
        assert_eq!(config.orchestrator.tool_selection, ToolSelection::Heuristic);
        assert!(config.pillar_enabled(Pillar::Rag));
        assert!(!config.pillar_enabled(Pillar::Tools));
        assert!(!config.pillar_enabled(Pillar::Agents));
    }

    #[test]
    fn test_unknown_provider_type_names_provider() {
        let toml = r#"
[[llm.providers]]
name = "remote"
type = "bard"
model = "x"
"#;
        let err = RagoConfig::from_toml_str(toml, "test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.message().contains("provider 'remote'"));
    }

    #[test]
    fn test_bad_weights_rejected() {
        let toml = r#"
[rag.search]
vector_weight = 0.9
keyword_weight = 0.9
"#;
        let err = RagoConfig::from_toml_str(toml, "test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_type_errors_carry_path() {
        let err = RagoConfig::from_toml_str("[orchestrator]\nmax_tool_calls = \"many\"", "test")
            .unwrap_err();
        assert!(err.message().contains("orchestrator.max_tool_calls"));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = RagoConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(RagoConfig::from_toml_str(&text, "rendered").unwrap(), config);
    }

    #[test]
    fn test_llm_only_mode() {
        let config = RagoConfig {
            mode: RunMode::LlmOnly,
            ..Default::default()
        };
        assert!(config.pillar_enabled(Pillar::Llm));
        assert!(!config.pillar_enabled(Pillar::Rag));
    }
}
