//! Health model shared by providers, tool servers and pillars

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Roll a set of member statuses into one: all healthy is healthy, none
    /// healthy is unhealthy, anything in between is degraded
    pub fn aggregate<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        let mut total = 0usize;
        let mut healthy = 0usize;
        let mut usable = 0usize;
        for status in statuses {
            total += 1;
            match status {
                HealthStatus::Healthy => {
                    healthy += 1;
                    usable += 1;
                }
                HealthStatus::Degraded => usable += 1,
                _ => {}
            }
        }
        if total == 0 {
            HealthStatus::Unknown
        } else if healthy == total {
            HealthStatus::Healthy
        } else if usable == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four pillars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pillar {
    Llm,
    Rag,
    Tools,
    Agents,
}

impl Pillar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pillar::Llm => "llm",
            Pillar::Rag => "rag",
            Pillar::Tools => "tools",
            Pillar::Agents => "agents",
        }
    }
}

impl fmt::Display for Pillar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated health snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub pillars: BTreeMap<Pillar, HealthStatus>,
    pub providers: BTreeMap<String, HealthStatus>,
    pub servers: BTreeMap<String, HealthStatus>,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}
