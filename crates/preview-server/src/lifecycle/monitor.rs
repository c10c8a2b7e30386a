//! Status polling, idle teardown and the background loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use preview_core::container::{ApplyOutcome, Observation, RemoteContainer};
use preview_core::types::ContainerStatus;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{LifecycleError, LifecycleService, MonitorSnapshot};

pub(crate) const REAPED_REASON: &str = "reaped by provider";
const IDLE_REASON: &str = "idle timeout";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Double the retry delay, capped at [`MAX_BACKOFF`].
pub(crate) fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

impl LifecycleService {
    /// Poll the provider for one container and fold the answer into its row.
    ///
    /// Terminal rows are answered from the store without a provider call. A
    /// container the provider no longer knows is marked stopped and reported
    /// normally; only exhausted transient failures are errors, and those
    /// leave the row untouched.
    pub async fn monitor_container(
        &self,
        container_id: &str,
    ) -> Result<MonitorSnapshot, LifecycleError> {
        let cid = container_id.to_string();
        let row = self
            .blocking(move |s| s.find_by_container_id(&cid))
            .await?
            .ok_or_else(|| LifecycleError::ContainerNotFound(container_id.to_string()))?;
        self.monitor_row(row).await
    }

    pub(crate) async fn monitor_row(
        &self,
        row: RemoteContainer,
    ) -> Result<MonitorSnapshot, LifecycleError> {
        if !row.is_active() {
            return Ok(MonitorSnapshot::from(&row));
        }

        let max_retries = self.settings.monitor_max_retries;
        let mut backoff = self.settings.monitor_backoff.min(MAX_BACKOFF);
        let mut attempt = 0;
        loop {
            match self.client.get_container_status(&row.container_id).await {
                Ok(report) => {
                    let obs = report.into_observation();
                    let row_id = row.id;
                    let (updated, outcome) = self
                        .blocking(move |s| s.apply_observation(row_id, &obs))
                        .await?;
                    if outcome == ApplyOutcome::Applied && updated.status.is_terminal() {
                        info!(
                            task_id = %updated.task_id,
                            container_id = %updated.container_id,
                            status = %updated.status,
                            "container reached terminal state"
                        );
                        self.qr_cache.invalidate_task(&updated.task_id);
                    }
                    return Ok(MonitorSnapshot::from(&updated));
                }
                Err(e) if e.is_not_found() => {
                    info!(
                        task_id = %row.task_id,
                        container_id = %row.container_id,
                        "container no longer exists on provider"
                    );
                    let updated = self
                        .apply(
                            row.id,
                            Observation::terminal(ContainerStatus::Stopped, REAPED_REASON),
                        )
                        .await?;
                    self.qr_cache.invalidate_task(&updated.task_id);
                    return Ok(MonitorSnapshot::from(&updated));
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    debug!(
                        container_id = %row.container_id,
                        attempt,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient status error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
                Err(e) => {
                    return Err(LifecycleError::Monitoring {
                        container_id: row.container_id,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        }
    }

    /// Poll every non-terminal row concurrently. Returns how many polls
    /// succeeded.
    pub async fn monitor_all(&self) -> Result<usize, LifecycleError> {
        let rows = self.blocking(|s| s.list_active_containers()).await?;
        let results = join_all(rows.into_iter().map(|row| self.monitor_row(row))).await;
        let mut ok = 0;
        for result in results {
            match result {
                Ok(_) => ok += 1,
                Err(e) => warn!(error = %e, "monitoring poll failed"),
            }
        }
        Ok(ok)
    }

    /// Resume monitoring after a restart using only stored provider ids.
    pub async fn resume(&self) -> Result<usize, LifecycleError> {
        let resumed = self.monitor_all().await?;
        info!(resumed, "resumed monitoring of active containers");
        Ok(resumed)
    }

    /// Stop running containers idle for longer than the configured threshold.
    /// Returns the stopped provider ids.
    pub async fn sweep_idle(&self) -> Result<Vec<String>, LifecycleError> {
        let idle = chrono::Duration::from_std(self.settings.idle_timeout)
            .map_err(|e| LifecycleError::Internal(format!("idle timeout out of range: {e}")))?;
        let cutoff = Utc::now() - idle;
        let rows = self.blocking(|s| s.list_active_containers()).await?;

        let mut stopped = Vec::new();
        for row in rows {
            if row.status != ContainerStatus::Running || row.last_activity_at >= cutoff {
                continue;
            }
            match self.stop_container(&row.container_id, IDLE_REASON).await {
                Ok(_) => stopped.push(row.container_id),
                Err(e) => warn!(container_id = %row.container_id, error = %e, "idle teardown failed"),
            }
        }
        Ok(stopped)
    }

    /// One pass of housekeeping: poll, idle sweep, in-memory map sweeps.
    pub async fn tick(&self) {
        if let Err(e) = self.monitor_all().await {
            error!(error = %e, "monitoring pass failed");
        }
        match self.sweep_idle().await {
            Ok(stopped) if !stopped.is_empty() => info!(count = stopped.len(), "stopped idle containers"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "idle sweep failed"),
        }
        let purged = self.qr_cache.purge_expired();
        let evicted = self.rate_limiter.as_ref().map(|l| l.sweep()).unwrap_or(0);
        if purged > 0 || evicted > 0 {
            debug!(purged, evicted, "swept in-memory caches");
        }
    }

    /// Background loop until `shutdown` is notified. The first tick runs
    /// immediately and doubles as startup resume.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            idle_timeout_secs = self.settings.idle_timeout.as_secs(),
            "lifecycle loop started"
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!("lifecycle loop received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    self.tick().await;
                    ticks += 1;
                    let every = u64::from(self.settings.reconcile_every);
                    if every > 0 && ticks % every == 0 {
                        match self.reconcile().await {
                            Ok(report) => report.log(),
                            Err(e) => error!(error = %e, "reconciliation failed"),
                        }
                    }
                }
            }
        }

        info!("lifecycle loop stopped");
    }
}
