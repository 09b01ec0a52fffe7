//! Cron scheduling and run admission
//!
//! The scheduler keeps the next fire time of every scheduled workflow and a
//! lane per workflow that bounds re-entrant runs. A run holds its lane slot
//! while waiting for a permit; once `max_concurrent + queue_size` runs are
//! admitted, further runs are dropped. Ticks missed while the process was
//! down are never replayed: the next fire time is always computed from now.

use crate::config::SchedulingConfig;
use crate::cron::CronSchedule;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rago_core::{Component, ErrorKind, RagoError, RagoResult};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Public view of one schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub workflow: String,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
    /// Runs holding a permit
    pub running: usize,
    /// Runs waiting for a permit
    pub queued: usize,
}

struct Entry {
    cron: CronSchedule,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct Lane {
    permits: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
}

/// An admitted run; releases its lane slot on drop
pub(crate) struct Admission {
    workflow: String,
    lane: Lane,
}

impl Admission {
    /// Waits until the run may start
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.lane.permits.clone().acquire_owned().await.ok()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.lane.admitted.fetch_sub(1, Ordering::SeqCst);
        debug!(workflow = %self.workflow, "Scheduled run released");
    }
}

pub(crate) struct Scheduler {
    config: SchedulingConfig,
    entries: DashMap<String, Entry>,
    lanes: DashMap<String, Lane>,
}

impl Scheduler {
    pub(crate) fn new(config: SchedulingConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            lanes: DashMap::new(),
        }
    }

    /// Installs or replaces the schedule of a workflow
    pub(crate) fn set_schedule(
        &self,
        workflow: &str,
        expression: &str,
        now: DateTime<Utc>,
    ) -> RagoResult<()> {
        let cron = CronSchedule::parse(expression)?;
        let next_run = cron.next_after(now);
        debug!(workflow, expression, next_run = ?next_run, "Schedule installed");
        self.entries
            .insert(workflow.to_string(), Entry { cron, next_run });
        Ok(())
    }

    pub(crate) fn remove_schedule(&self, workflow: &str) {
        self.entries.remove(workflow);
    }

    pub(crate) fn next_run(&self, workflow: &str) -> Option<DateTime<Utc>> {
        self.entries.get(workflow).and_then(|e| e.next_run)
    }

    /// Earliest fire time across all schedules
    pub(crate) fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.next_run).min()
    }

    /// Workflows due at `now`; each fires once and moves to its next time
    pub(crate) fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if matches!(entry.next_run, Some(at) if at <= now) {
                due.push(entry.key().clone());
                entry.next_run = entry.cron.next_after(now);
            }
        }
        due.sort();
        due
    }

    fn lane(&self, workflow: &str) -> Lane {
        self.lanes
            .entry(workflow.to_string())
            .or_insert_with(|| Lane {
                permits: Arc::new(Semaphore::new(self.config.max_concurrent.max(1))),
                admitted: Arc::new(AtomicUsize::new(0)),
            })
            .clone()
    }

    /// Reserves a slot for one run of `workflow`
    pub(crate) fn admit(&self, workflow: &str) -> RagoResult<Admission> {
        let lane = self.lane(workflow);
        let capacity = self.config.max_concurrent.max(1) + self.config.queue_size;
        let admitted = lane
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            });
        match admitted {
            Ok(_) => Ok(Admission {
                workflow: workflow.to_string(),
                lane,
            }),
            Err(_) => Err(RagoError::new(
                ErrorKind::ScheduleSaturated,
                format!(
                    "workflow '{}' already has {} runs admitted",
                    workflow, capacity
                ),
            )
            .at(Component::Agents, "schedule")),
        }
    }

    pub(crate) fn schedules(&self) -> Vec<ScheduleInfo> {
        let mut infos: Vec<ScheduleInfo> = self
            .entries
            .iter()
            .map(|entry| {
                let (running, queued) = self.occupancy(entry.key());
                ScheduleInfo {
                    workflow: entry.key().clone(),
                    expression: entry.cron.source().to_string(),
                    next_run: entry.next_run,
                    running,
                    queued,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.workflow.cmp(&b.workflow));
        infos
    }

    fn occupancy(&self, workflow: &str) -> (usize, usize) {
        let Some(lane) = self.lanes.get(workflow) else {
            return (0, 0);
        };
        let max = self.config.max_concurrent.max(1);
        let running = max - lane.permits.available_permits().min(max);
        let admitted = lane.admitted.load(Ordering::SeqCst);
        (running, admitted.saturating_sub(running))
    }
}
