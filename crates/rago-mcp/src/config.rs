//! Tool host configuration (`[mcp]` section)

use rago_core::{Component, RagoError, RagoResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::Framing;

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    1
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// One tool server child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Start with the host; otherwise on the first call that needs it
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub restart_backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub restart_backoff_max_ms: u64,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            auto_start: true,
            max_restarts: default_max_restarts(),
            restart_backoff_initial_ms: default_backoff_initial_ms(),
            restart_backoff_max_ms: default_backoff_max_ms(),
            framing: Framing::default(),
            max_in_flight: default_max_in_flight(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn lazy(mut self) -> Self {
        self.auto_start = false;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Delay before the `attempt`-th restart (1-based): doubles from the
    /// initial delay up to the cap
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .restart_backoff_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.restart_backoff_max_ms);
        Duration::from_millis(delay)
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_hard_cancel_timeout_secs() -> u64 {
    5
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_batch_concurrency() -> usize {
    8
}

/// `[mcp]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// How long a cancelled call may keep its slot while the server winds down
    #[serde(default = "default_hard_cancel_timeout_secs")]
    pub hard_cancel_timeout_secs: u64,
    #[serde(default)]
    pub enable_cache: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Defaults to twice the check interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
            call_timeout_secs: default_call_timeout_secs(),
            hard_cancel_timeout_secs: default_hard_cancel_timeout_secs(),
            enable_cache: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            check_interval_secs: default_check_interval_secs(),
            stale_after_secs: None,
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl McpConfig {
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn hard_cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_cancel_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.stale_after_secs
                .unwrap_or(self.check_interval_secs.max(1) * 2),
        )
    }

    pub fn validate(&self) -> RagoResult<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(RagoError::config("tool server name must not be empty")
                    .at(Component::Config, "validate"));
            }
            if server.name.contains('.') {
                return Err(RagoError::config(format!(
                    "tool server name '{}' must not contain '.'",
                    server.name
                ))
                .at(Component::Config, "validate"));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(RagoError::config(format!(
                    "duplicate tool server name '{}'",
                    server.name
                ))
                .at(Component::Config, "validate"));
            }
            if server.command.trim().is_empty() {
                return Err(RagoError::config(format!(
                    "tool server '{}' has no command",
                    server.name
                ))
                .at(Component::Config, "validate"));
            }
            if server.max_in_flight == 0 {
                return Err(RagoError::config(format!(
                    "tool server '{}' needs max_in_flight >= 1",
                    server.name
                ))
                .at(Component::Config, "validate"));
            }
        }
        Ok(())
    }
}
