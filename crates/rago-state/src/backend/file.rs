//! File-backed state store
//!
//! Layout under the root directory:
//!
//! ```text
//! workflows/<name>.json
//! agents/<name>.json
//! executions/<id>.json
//! memory/<agent>.json
//! ```
//!
//! Entities are cached in memory after the initial scan. Every write goes to
//! a temporary sibling file that is then renamed over the target, so a crash
//! mid-write leaves either the old or the new record on disk.

use super::{cutoff, is_expired, StateStore};
use async_trait::async_trait;
use rago_core::{
    AgentDefinition, Component, ExecutionContext, Message, RagoError, RagoResult,
    WorkflowDefinition,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const WORKFLOWS: &str = "workflows";
const AGENTS: &str = "agents";
const EXECUTIONS: &str = "executions";
const MEMORY: &str = "memory";

/// Persistent store writing one JSON file per entity
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
    workflows: Arc<RwLock<HashMap<String, WorkflowDefinition>>>,
    agents: Arc<RwLock<HashMap<String, AgentDefinition>>>,
    executions: Arc<RwLock<HashMap<String, ExecutionContext>>>,
}

impl FileStateStore {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// Executions found in a non-terminal status were cut short by a previous
    /// process; they keep their last status and are marked `interrupted`.
    pub async fn open(root: impl AsRef<Path>) -> RagoResult<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [WORKFLOWS, AGENTS, EXECUTIONS, MEMORY] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path).await.map_err(|e| {
                RagoError::internal(format!(
                    "Failed to create state directory {}: {}",
                    path.display(),
                    e
                ))
                .at(Component::State, "open")
                .with_source(e)
            })?;
        }

        let workflows: HashMap<String, WorkflowDefinition> = scan(&root.join(WORKFLOWS))
            .await?
            .into_iter()
            .map(|w: WorkflowDefinition| (w.name.clone(), w))
            .collect();
        let agents: HashMap<String, AgentDefinition> = scan(&root.join(AGENTS))
            .await?
            .into_iter()
            .map(|a: AgentDefinition| (a.name.clone(), a))
            .collect();
        let mut executions: HashMap<String, ExecutionContext> = scan(&root.join(EXECUTIONS))
            .await?
            .into_iter()
            .map(|e: ExecutionContext| (e.id.clone(), e))
            .collect();

        let mut interrupted = 0;
        for execution in executions.values_mut() {
            if !execution.status.is_terminal() && !execution.interrupted {
                execution.interrupted = true;
                interrupted += 1;
                let path = entity_path(&root, EXECUTIONS, &execution.id);
                if let Err(e) = write_json(&path, execution).await {
                    warn!("Failed to flag interrupted execution {}: {}", execution.id, e);
                }
            }
        }

        info!(
            root = %root.display(),
            workflows = workflows.len(),
            agents = agents.len(),
            executions = executions.len(),
            interrupted,
            "Opened file state store"
        );

        Ok(Self {
            root,
            workflows: Arc::new(RwLock::new(workflows)),
            agents: Arc::new(RwLock::new(agents)),
            executions: Arc::new(RwLock::new(executions)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: &str, key: &str) -> PathBuf {
        entity_path(&self.root, kind, key)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> RagoResult<()> {
        let mut workflows = self.workflows.write().await;
        write_json(&self.path(WORKFLOWS, &workflow.name), workflow)
            .await
            .map_err(|e| e.at(Component::State, "save_workflow"))?;
        workflows.insert(workflow.name.clone(), workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, name: &str) -> RagoResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(name).cloned())
    }

    async fn list_workflows(&self) -> RagoResult<Vec<WorkflowDefinition>> {
        let mut workflows: Vec<_> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn delete_workflow(&self, name: &str) -> RagoResult<bool> {
        let mut workflows = self.workflows.write().await;
        if workflows.remove(name).is_none() {
            return Ok(false);
        }
        remove_file(&self.path(WORKFLOWS, name))
            .await
            .map_err(|e| e.at(Component::State, "delete_workflow"))?;
        Ok(true)
    }

    async fn save_agent(&self, agent: &AgentDefinition) -> RagoResult<()> {
        let mut agents = self.agents.write().await;
        write_json(&self.path(AGENTS, &agent.name), agent)
            .await
            .map_err(|e| e.at(Component::State, "save_agent"))?;
        agents.insert(agent.name.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> RagoResult<Vec<AgentDefinition>> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn save_execution(&self, execution: &ExecutionContext) -> RagoResult<()> {
        let mut executions = self.executions.write().await;
        write_json(&self.path(EXECUTIONS, &execution.id), execution)
            .await
            .map_err(|e| e.at(Component::State, "save_execution"))?;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> RagoResult<Option<ExecutionContext>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn list_executions(&self) -> RagoResult<Vec<ExecutionContext>> {
        let mut executions: Vec<_> = self.executions.read().await.values().cloned().collect();
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }

    async fn delete_execution(&self, id: &str) -> RagoResult<bool> {
        let mut executions = self.executions.write().await;
        if executions.remove(id).is_none() {
            return Ok(false);
        }
        remove_file(&self.path(EXECUTIONS, id))
            .await
            .map_err(|e| e.at(Component::State, "delete_execution"))?;
        Ok(true)
    }

    async fn save_memory(&self, agent: &str, messages: &[Message]) -> RagoResult<()> {
        write_json(&self.path(MEMORY, agent), &messages)
            .await
            .map_err(|e| e.at(Component::State, "save_memory"))
    }

    async fn load_memory(&self, agent: &str) -> RagoResult<Vec<Message>> {
        let path = self.path(MEMORY, agent);
        match read_json::<Vec<Message>>(&path).await {
            Ok(Some(messages)) => Ok(messages),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e.at(Component::State, "load_memory")),
        }
    }

    async fn cleanup(&self, ttl: Duration) -> RagoResult<usize> {
        let cutoff = cutoff(ttl);
        let mut executions = self.executions.write().await;
        let expired: Vec<String> = executions
            .values()
            .filter(|e| is_expired(e, cutoff))
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            executions.remove(id);
            if let Err(e) = remove_file(&self.path(EXECUTIONS, id)).await {
                warn!("Failed to remove expired execution {}: {}", id, e);
            }
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Cleaned up expired executions");
        }
        Ok(expired.len())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

fn entity_path(root: &Path, kind: &str, key: &str) -> PathBuf {
    root.join(kind).join(format!("{}.json", file_stem(key)))
}

/// Maps an entity key onto a safe file stem
fn file_stem(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match stem.trim_start_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> RagoResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, content).await.map_err(|e| {
        RagoError::internal(format!("Failed to write {}: {}", tmp.display(), e)).with_source(e)
    })?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(
            RagoError::internal(format!("Failed to replace {}: {}", path.display(), e))
                .with_source(e),
        );
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> RagoResult<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(
                RagoError::internal(format!("Failed to read {}: {}", path.display(), e))
                    .with_source(e),
            )
        }
    };
    serde_json::from_str(&content).map(Some).map_err(|e| {
        RagoError::internal(format!("Failed to parse {}: {}", path.display(), e)).with_source(e)
    })
}

async fn remove_file(path: &Path) -> RagoResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(
            RagoError::internal(format!("Failed to remove {}: {}", path.display(), e))
                .with_source(e),
        ),
    }
}

/// Reads every `*.json` file in a directory, skipping unreadable ones
async fn scan<T: DeserializeOwned>(dir: &Path) -> RagoResult<Vec<T>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        RagoError::internal(format!("Failed to list {}: {}", dir.display(), e))
            .at(Component::State, "open")
            .with_source(e)
    })?;

    let mut items = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read entry in {}: {}", dir.display(), e);
                break;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping corrupt state file: {}", e),
        }
    }
    Ok(items)
}
