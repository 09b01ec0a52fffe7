//! Health Monitor
//!
//! Two probes share one cached [`HealthReport`]:
//!
//! - [`HealthMonitor::check`] probes only the providers, refreshes the tool
//!   servers from supervisor state and carries the last known status for
//!   retrieval and agents; `overall` follows the generation pillar.
//! - [`HealthMonitor::full_check`] asks every enabled pillar and rolls the
//!   answers up into `overall`.
//!
//! The background ticker runs full checks on a fixed interval.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rago_agents::WorkflowEngine;
use rago_core::{CancellationToken, HealthReport, HealthStatus, Pillar};
use rago_llm::ProviderRegistry;
use rago_mcp::ToolHost;
use rago_rag::RetrievalEngine;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handles of the enabled pillars
#[derive(Clone, Default)]
pub(crate) struct Pillars {
    pub llm: Option<Arc<ProviderRegistry>>,
    pub rag: Option<Arc<RetrievalEngine>>,
    pub tools: Option<Arc<ToolHost>>,
    pub agents: Option<WorkflowEngine>,
}

pub struct HealthMonitor {
    pillars: Pillars,
    last: RwLock<HealthReport>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Overall status of a full check: unknown pillars count only when nothing
/// else is known
fn roll_up(pillars: &BTreeMap<Pillar, HealthStatus>) -> HealthStatus {
    if pillars.is_empty() {
        return HealthStatus::Unknown;
    }
    let known: Vec<HealthStatus> = pillars
        .values()
        .copied()
        .filter(|s| *s != HealthStatus::Unknown)
        .collect();
    if known.is_empty() {
        return HealthStatus::Unhealthy;
    }
    HealthStatus::aggregate(known)
}

impl HealthMonitor {
    pub(crate) fn new(pillars: Pillars) -> Self {
        Self {
            pillars,
            last: RwLock::new(HealthReport::default()),
            ticker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Last report produced by either check
    pub fn report(&self) -> HealthReport {
        self.last.read().clone()
    }

    /// Fast check: probes providers only
    pub async fn check(&self) -> HealthReport {
        let mut report = self.report();
        match &self.pillars.llm {
            Some(llm) => {
                report.providers = llm.probe_all().await;
                let status = llm.pillar_status();
                report.pillars.insert(Pillar::Llm, status);
                report.overall = status;
            }
            None => {
                report.pillars.remove(&Pillar::Llm);
                report.providers.clear();
                report.overall = HealthStatus::Unknown;
            }
        }
        if let Some(tools) = &self.pillars.tools {
            report.servers = tools.health();
            report.pillars.insert(Pillar::Tools, tools.pillar_status());
        }
        report.last_check = Some(Utc::now());
        debug!(overall = %report.overall, "Fast health check");
        *self.last.write() = report.clone();
        report
    }

    /// Full check across every enabled pillar
    pub async fn full_check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        if let Some(llm) = &self.pillars.llm {
            report.providers = llm.probe_all().await;
            report.pillars.insert(Pillar::Llm, llm.pillar_status());
        }
        if let Some(rag) = &self.pillars.rag {
            report.pillars.insert(Pillar::Rag, rag.health().await);
            report
                .details
                .insert("rag_documents".to_string(), json!(rag.document_count()));
        }
        if let Some(tools) = &self.pillars.tools {
            report.servers = tools.health();
            report.pillars.insert(Pillar::Tools, tools.pillar_status());
            report
                .details
                .insert("tools".to_string(), json!(tools.list_tools().len()));
        }
        if let Some(agents) = &self.pillars.agents {
            let status = match agents.list_executions().await {
                Ok(_) => HealthStatus::Healthy,
                Err(e) => {
                    warn!(error = %e, "Workflow state store unavailable");
                    HealthStatus::Unhealthy
                }
            };
            report.pillars.insert(Pillar::Agents, status);
            report.details.insert(
                "agents_running".to_string(),
                json!(agents.running_executions().len()),
            );
        }

        report.overall = roll_up(&report.pillars);
        report.last_check = Some(Utc::now());
        if report.overall != HealthStatus::Healthy {
            warn!(overall = %report.overall, pillars = ?report.pillars, "Health check");
        } else {
            debug!("Health check: all pillars healthy");
        }
        *self.last.write() = report.clone();
        report
    }

    /// Starts periodic full checks; a second call is a no-op
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let monitor: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.full_check().await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "Health monitor started");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.ticker.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
