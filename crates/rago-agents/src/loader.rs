//! Definition files
//!
//! A definition file holds one workflow or one agent, discriminated by a
//! top-level `kind` field. YAML and JSON are both accepted.
//!
//! ```yaml
//! kind: Workflow
//! name: nightly-report
//! schedule: "0 2 * * *"
//! steps:
//!   - id: fetch
//!     kind: tool
//!     tool: fetch_metrics
//!   - id: summarize
//!     kind: generate
//!     prompt: "Summarize: {{steps.fetch.output}}"
//!     depends_on: [fetch]
//! ```

use rago_core::{AgentDefinition, Component, RagoError, RagoResult, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Definition {
    Workflow(WorkflowDefinition),
    Agent(AgentDefinition),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::Workflow(w) => &w.name,
            Definition::Agent(a) => &a.name,
        }
    }
}

/// Parses one definition; `origin` names the source in error messages
pub fn parse_definition(content: &str, origin: &str) -> RagoResult<Definition> {
    let deserializer = serde_yaml::Deserializer::from_str(content);
    serde_path_to_error::deserialize(deserializer).map_err(|e| {
        let path = e.path().to_string();
        RagoError::config(format!(
            "failed to parse definition {} at '{}': {}",
            origin,
            path,
            e.inner()
        ))
        .at(Component::Agents, "load_definition")
    })
}

pub fn load_file(path: &Path) -> RagoResult<Definition> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RagoError::config(format!("failed to read definition {}: {}", path.display(), e))
            .at(Component::Agents, "load_definition")
            .with_source(e)
    })?;
    parse_definition(&content, &path.display().to_string())
}

/// Loads every `*.yaml`, `*.yml` and `*.json` file of `dir` in name order
pub fn load_dir(dir: &Path) -> RagoResult<Vec<Definition>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RagoError::config(format!(
            "failed to read definitions directory {}: {}",
            dir.display(),
            e
        ))
        .at(Component::Agents, "load_definition")
        .with_source(e)
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let definition = load_file(&path)?;
        debug!(path = %path.display(), name = %definition.name(), "Loaded definition");
        definitions.push(definition);
    }
    info!(
        "Loaded {} definitions from {}",
        definitions.len(),
        dir.display()
    );
    Ok(definitions)
}
