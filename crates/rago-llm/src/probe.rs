//! Background provider health probing

use futures::future::join_all;
use rago_core::{CancellationToken, HealthStatus, RagoError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::{ProviderEntry, ProviderRegistry};

/// Outcome of a single probe
#[derive(Debug)]
pub(crate) enum ProbeOutcome {
    Ok,
    TimedOut,
    Failed(RagoError),
}

/// Next health state given the previous one and a probe outcome
///
/// A success always restores `healthy`. A timeout is `unhealthy`. A single
/// recoverable failure on a provider that was fine moves it to `degraded`;
/// a second one, or any non-recoverable failure, makes it `unhealthy`.
pub(crate) fn next_status(previous: HealthStatus, outcome: &ProbeOutcome) -> HealthStatus {
    match outcome {
        ProbeOutcome::Ok => HealthStatus::Healthy,
        ProbeOutcome::TimedOut => HealthStatus::Unhealthy,
        ProbeOutcome::Failed(err) if err.is_retryable() => match previous {
            HealthStatus::Healthy | HealthStatus::Unknown => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        },
        ProbeOutcome::Failed(_) => HealthStatus::Unhealthy,
    }
}

async fn probe_one(entry: &ProviderEntry, timeout: Duration) {
    let outcome = match tokio::time::timeout(timeout, entry.handle.health_probe(timeout)).await {
        Ok(Ok(())) => ProbeOutcome::Ok,
        Ok(Err(e)) => ProbeOutcome::Failed(e),
        Err(_) => ProbeOutcome::TimedOut,
    };
    if let ProbeOutcome::Failed(e) = &outcome {
        debug!(provider = %entry.name(), error = %e, "Health probe failed");
    }
    entry.set_health(next_status(entry.health(), &outcome));
}

/// Probes the given providers concurrently
pub(crate) async fn probe_entries(entries: &[Arc<ProviderEntry>], timeout: Duration) {
    join_all(entries.iter().map(|e| probe_one(e, timeout))).await;
}

/// Spawns the periodic prober; it exits on shutdown or once the registry is dropped
pub(crate) fn spawn(
    registry: Weak<ProviderRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Provider health checks started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let entries = registry.entries();
            let timeout = registry.config().probe_timeout();
            drop(registry);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = probe_entries(&entries, timeout) => {}
            }
        }
        debug!("Provider health checks stopped");
    })
}
