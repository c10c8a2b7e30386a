//! Container lifecycle: provision, monitor, stop and reconcile remote
//! bundler containers.
//!
//! The provider is the source of truth for container liveness; container
//! rows in the store are a cache that tolerates staleness. Every path that
//! could leave a provider container without a row records a reconciliation
//! candidate, and [`LifecycleService::reconcile`] cleans those up.

mod error;
mod locks;
mod monitor;
mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use preview_core::config::Config;
use preview_core::container::{Observation, ReconcileCandidate, RemoteContainer};
use preview_core::qr::QrCacheStore;
use preview_core::rate_limit::RateLimit;
use preview_core::store::Store;
use preview_core::types::{ContainerStatus, ResourceUsage};
use preview_provider::{
    ContainerClient, ContainerSpec, CreateOutcome, LogPage, LogQuery, ProviderError,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use error::{LifecycleError, PROVISION_FAILED_MESSAGE};
pub use reconcile::ReconcileReport;

use locks::TaskLocks;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub image: String,
    pub port: u16,
    pub create_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub monitor_max_retries: u32,
    pub monitor_backoff: Duration,
    pub reconcile_every: u32,
}

impl LifecycleSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            image: cfg.provider.image.clone(),
            port: cfg.provider.port,
            create_timeout: cfg.provider.create_timeout(),
            poll_interval: cfg.lifecycle.poll_interval(),
            idle_timeout: cfg.lifecycle.idle_timeout(),
            monitor_max_retries: cfg.lifecycle.monitor_max_retries,
            monitor_backoff: cfg.lifecycle.monitor_backoff(),
            reconcile_every: cfg.lifecycle.reconcile_every,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    pub container_id: String,
    pub metro_url: String,
    pub db_id: Uuid,
    pub status: ContainerStatus,
    /// An existing live container was returned instead of creating one.
    pub reused: bool,
}

impl Provisioned {
    fn from_row(row: &RemoteContainer, reused: bool) -> Self {
        Self {
            container_id: row.container_id.clone(),
            metro_url: row.metro_url.clone(),
            db_id: row.id,
            status: row.status,
            reused,
        }
    }
}

/// Resource usage snapshot returned to status pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub container_id: String,
    pub status: ContainerStatus,
    pub resource_usage: ResourceUsage,
    pub uptime_seconds: u64,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&RemoteContainer> for MonitorSnapshot {
    fn from(row: &RemoteContainer) -> Self {
        Self {
            container_id: row.container_id.clone(),
            status: row.status,
            resource_usage: row.resource_usage.unwrap_or_default(),
            uptime_seconds: row.uptime_seconds.unwrap_or(0),
            last_activity_at: row.last_activity_at,
            reason: row.status_reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleService
// ---------------------------------------------------------------------------

pub struct LifecycleService {
    store: Arc<Store>,
    client: Arc<dyn ContainerClient>,
    qr_cache: Arc<dyn QrCacheStore>,
    rate_limiter: Option<Arc<dyn RateLimit>>,
    settings: LifecycleSettings,
    locks: TaskLocks,
}

impl LifecycleService {
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn ContainerClient>,
        qr_cache: Arc<dyn QrCacheStore>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            client,
            qr_cache,
            rate_limiter: None,
            settings,
            locks: TaskLocks::default(),
        }
    }

    /// Sweep this limiter's expired windows on every loop tick.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimit>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, LifecycleError>
    where
        F: FnOnce(&Store) -> preview_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| LifecycleError::Internal(format!("store task join error: {e}")))?
            .map_err(LifecycleError::from)
    }

    async fn apply(
        &self,
        row_id: Uuid,
        obs: Observation,
    ) -> Result<RemoteContainer, LifecycleError> {
        let (row, _) = self
            .blocking(move |s| s.apply_observation(row_id, &obs))
            .await?;
        Ok(row)
    }

    async fn record_candidate(&self, candidate: ReconcileCandidate) {
        warn!(
            reconcile = true,
            task_id = %candidate.task_id,
            container_id = candidate.container_id.as_deref().unwrap_or("-"),
            reason = %candidate.reason,
            "recording reconciliation candidate"
        );
        if let Err(e) = self.blocking(move |s| s.record_candidate(&candidate)).await {
            error!(reconcile = true, error = %e, "failed to persist reconciliation candidate");
        }
    }

    // ── Provisioning ──────────────────────────────────────────────────

    /// Ensure the task has one live bundler container and return its URL.
    ///
    /// Idempotent for sequential calls: a live container is returned as-is.
    /// Concurrent calls for one task are serialized in-process.
    pub async fn provision_container(
        &self,
        task_id: &str,
        user_id: &str,
        admin: bool,
    ) -> Result<Provisioned, LifecycleError> {
        let _guard = self.locks.lock(task_id).await;

        let (tid, uid) = (task_id.to_string(), user_id.to_string());
        let task = self
            .blocking(move |s| s.find_task(&tid, &uid, admin))
            .await
            .map_err(|e| match e {
                LifecycleError::Store(inner) => LifecycleError::from_lookup(inner),
                other => other,
            })?;
        if !task.platform.needs_bundler() {
            return Err(LifecycleError::NotMobile {
                task_id: task.id,
                platform: task.platform,
            });
        }

        let tid = task.id.clone();
        if let Some(existing) = self
            .blocking(move |s| s.active_container_for_task(&tid))
            .await?
        {
            if let Some(live) = self.check_existing(existing).await? {
                return Ok(live);
            }
        }

        let spec = ContainerSpec::for_task(
            &task.id,
            &task.user_id,
            &self.settings.image,
            self.settings.port,
            self.settings.idle_timeout.as_secs(),
        );
        let outcome =
            match tokio::time::timeout(self.settings.create_timeout, self.client.create_container(&spec))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => CreateOutcome::Ambiguous {
                    reason: format!(
                        "create did not finish within {:?}",
                        self.settings.create_timeout
                    ),
                },
            };

        let ids = match outcome {
            CreateOutcome::Created(ids) => ids,
            CreateOutcome::Failed(err) => {
                error!(task_id = %task.id, error = %err, "container provisioning failed");
                return Err(LifecycleError::ProvisioningFailed {
                    task_id: task.id,
                    source: err,
                });
            }
            CreateOutcome::Ambiguous { reason } => {
                self.record_candidate(ReconcileCandidate::new(&task.id, None, reason.clone()))
                    .await;
                return Err(LifecycleError::Ambiguous {
                    task_id: task.id,
                    reason,
                });
            }
        };

        // The task may have been deleted while the create was in flight.
        let tid = task.id.clone();
        let visible = self
            .blocking(move |s| s.get_task(&tid))
            .await?
            .is_some_and(|t| !t.is_deleted());
        if !visible {
            info!(task_id = %task.id, container_id = %ids.container_id, "task deleted during provisioning, discarding container");
            self.discard_container(&task.id, &ids.container_id).await;
            return Err(LifecycleError::TaskNotFound(task.id));
        }

        // Persist before trusting the identifiers.
        let row = RemoteContainer::provisioning(&task.id, &task.user_id, ids);
        let to_insert = row.clone();
        if let Err(e) = self
            .blocking(move |s| s.insert_container(&to_insert))
            .await
        {
            self.record_candidate(ReconcileCandidate::new(
                &task.id,
                Some(row.container_id.clone()),
                format!("container row could not be written: {e}"),
            ))
            .await;
            let source = match e {
                LifecycleError::Store(inner) => inner,
                other => preview_core::PreviewError::Store(other.to_string()),
            };
            return Err(LifecycleError::Persistence {
                container_id: row.container_id,
                source,
            });
        }
        info!(task_id = %task.id, container_id = %row.container_id, "container created");

        let row = self.start_and_confirm(row).await?;
        self.qr_cache.invalidate_task(&task.id);
        if row.status.is_terminal() {
            error!(
                task_id = %task.id,
                container_id = %row.container_id,
                status = %row.status,
                "container went terminal during start"
            );
            return Err(LifecycleError::StartFailed {
                task_id: task.id,
                container_id: row.container_id,
                status: row.status,
            });
        }
        Ok(Provisioned::from_row(&row, false))
    }

    /// Stop a container no row will ever claim. A failed stop is left to
    /// reconciliation.
    async fn discard_container(&self, task_id: &str, container_id: &str) {
        match self.client.stop_container(container_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                self.record_candidate(ReconcileCandidate::new(
                    task_id,
                    Some(container_id.to_string()),
                    format!("discarded container could not be stopped: {e}"),
                ))
                .await;
            }
        }
    }

    /// Decide what to do with a task's non-terminal row. `Some` means it is
    /// live (or cannot be checked) and should be returned as-is.
    async fn check_existing(
        &self,
        existing: RemoteContainer,
    ) -> Result<Option<Provisioned>, LifecycleError> {
        match self.client.get_container_status(&existing.container_id).await {
            Ok(report) if report.status.is_terminal() => {
                let status = report.status;
                self.apply(existing.id, Observation::terminal(status, "stopped on provider"))
                    .await?;
                self.qr_cache.invalidate_task(&existing.task_id);
                Ok(None)
            }
            Ok(report) => {
                let mut row = self.apply(existing.id, report.into_observation()).await?;
                if row.status == ContainerStatus::Provisioning {
                    row = self.start_and_confirm(row).await?;
                }
                if row.status.is_terminal() {
                    self.qr_cache.invalidate_task(&row.task_id);
                    return Ok(None);
                }
                Ok(Some(Provisioned::from_row(&row, true)))
            }
            Err(e) if e.is_not_found() => {
                info!(
                    task_id = %existing.task_id,
                    container_id = %existing.container_id,
                    "previous container reaped by provider, provisioning a new one"
                );
                self.apply(
                    existing.id,
                    Observation::terminal(ContainerStatus::Stopped, monitor::REAPED_REASON),
                )
                .await?;
                self.qr_cache.invalidate_task(&existing.task_id);
                Ok(None)
            }
            Err(e) => {
                warn!(
                    task_id = %existing.task_id,
                    container_id = %existing.container_id,
                    error = %e,
                    "could not verify existing container, returning it rather than provisioning another"
                );
                Ok(Some(Provisioned::from_row(&existing, true)))
            }
        }
    }

    /// Start the container and promote the row when the provider confirms it
    /// is running. Failures leave the row in `Provisioning` for monitoring;
    /// a terminal confirmation is recorded and returned to the caller.
    async fn start_and_confirm(
        &self,
        row: RemoteContainer,
    ) -> Result<RemoteContainer, LifecycleError> {
        if let Err(e) = self.client.start_container(&row.container_id).await {
            warn!(container_id = %row.container_id, error = %e, "start failed, monitoring will retry");
            return Ok(row);
        }
        match self.client.get_container_status(&row.container_id).await {
            Ok(report) => self.apply(row.id, report.into_observation()).await,
            Err(e) => {
                warn!(container_id = %row.container_id, error = %e, "could not confirm container status");
                Ok(row)
            }
        }
    }

    // ── Stop / teardown ───────────────────────────────────────────────

    /// Stop a container explicitly. Stopping a terminal row is a no-op.
    pub async fn stop_container(
        &self,
        container_id: &str,
        reason: &str,
    ) -> Result<MonitorSnapshot, LifecycleError> {
        let cid = container_id.to_string();
        let row = self
            .blocking(move |s| s.find_by_container_id(&cid))
            .await?
            .ok_or_else(|| LifecycleError::ContainerNotFound(container_id.to_string()))?;
        if !row.is_active() {
            return Ok(MonitorSnapshot::from(&row));
        }

        match self.client.stop_container(&row.container_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(container_id = %row.container_id, "container already gone on provider");
            }
            Err(e) => return Err(LifecycleError::Provider(e)),
        }

        let row = self
            .apply(row.id, Observation::terminal(ContainerStatus::Stopped, reason))
            .await?;
        self.qr_cache.invalidate_task(&row.task_id);
        info!(task_id = %row.task_id, container_id = %row.container_id, reason, "container stopped");
        Ok(MonitorSnapshot::from(&row))
    }

    /// Stop the active container of a task that is going away.
    ///
    /// Waits for an in-flight provision of the task so its container is
    /// seen here.
    pub async fn teardown_task(
        &self,
        task_id: &str,
    ) -> Result<Option<MonitorSnapshot>, LifecycleError> {
        let _guard = self.locks.lock(task_id).await;
        let tid = task_id.to_string();
        let active = self
            .blocking(move |s| s.active_container_for_task(&tid))
            .await?;
        self.qr_cache.invalidate_task(task_id);
        match active {
            Some(row) => self
                .stop_container(&row.container_id, "task deleted")
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    // ── Logs ──────────────────────────────────────────────────────────

    /// Recent logs of the task's latest container. A container the provider
    /// no longer knows has no logs.
    pub async fn container_logs(
        &self,
        task_id: &str,
        user_id: &str,
        admin: bool,
        query: LogQuery,
    ) -> Result<LogPage, LifecycleError> {
        let row = self.task_container(task_id, user_id, admin).await?;
        match self.client.get_container_logs(&row.container_id, &query).await {
            Ok(page) => Ok(page),
            Err(ProviderError::NotFound(_)) => Ok(LogPage::default()),
            Err(e) => Err(LifecycleError::Provider(e)),
        }
    }

    /// The latest container row of a task visible to the caller.
    pub async fn task_container(
        &self,
        task_id: &str,
        user_id: &str,
        admin: bool,
    ) -> Result<RemoteContainer, LifecycleError> {
        let (tid, uid) = (task_id.to_string(), user_id.to_string());
        self.blocking(move |s| {
            s.find_task(&tid, &uid, admin)?;
            s.latest_container_for_task(&tid)
        })
        .await
        .map_err(|e| match e {
            LifecycleError::Store(inner) => LifecycleError::from_lookup(inner),
            other => other,
        })?
        .ok_or_else(|| LifecycleError::ContainerNotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests;
