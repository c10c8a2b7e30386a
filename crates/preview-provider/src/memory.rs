//! In-process provider for local development and tests.
//!
//! Containers live in a map behind a mutex. Failures can be scripted so the
//! lifecycle's recovery paths can be driven deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use preview_core::container::ProvisionedIds;
use preview_core::types::{ContainerStatus, ResourceUsage};
use tokio::sync::Mutex;

use crate::client::ContainerClient;
use crate::error::ProviderError;
use crate::types::{
    ContainerSpec, CreateOutcome, LogLine, LogPage, LogQuery, ProviderContainer, StartReport,
    StatusReport,
};

#[derive(Debug, Clone)]
struct MemoryContainer {
    task_id: String,
    status: ContainerStatus,
    started_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
    resource_usage: ResourceUsage,
    logs: Vec<LogLine>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, MemoryContainer>,
    fail_next_create: Option<ProviderError>,
    ambiguous_next_create: bool,
    /// Held after the next create before it reports back.
    create_delay: Option<Duration>,
    crash_next_start: bool,
    /// Remaining transient failures per container id.
    status_failures: HashMap<String, u32>,
    create_calls: u32,
}

#[derive(Clone, Default)]
pub struct MemoryContainerClient {
    state: Arc<Mutex<State>>,
    metro_domain: Option<String>,
}

impl MemoryContainerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundler URLs become `https://{container_id}.{domain}`.
    pub fn with_metro_domain(domain: impl Into<String>) -> Self {
        Self {
            metro_domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// The next create call returns `Failed(err)` without creating anything.
    pub async fn fail_next_create(&self, err: ProviderError) {
        self.state.lock().await.fail_next_create = Some(err);
    }

    /// The next create call creates a container but reports `Ambiguous`.
    pub async fn ambiguous_next_create(&self) {
        self.state.lock().await.ambiguous_next_create = true;
    }

    /// The next create makes its container at once but takes `delay` to
    /// answer, like a slow provider API.
    pub async fn delay_next_create(&self, delay: Duration) {
        self.state.lock().await.create_delay = Some(delay);
    }

    /// The next start leaves its container in `Error` instead of running it.
    pub async fn crash_next_start(&self) {
        self.state.lock().await.crash_next_start = true;
    }

    /// The next `times` status polls for `container_id` fail transiently.
    pub async fn fail_status(&self, container_id: &str, times: u32) {
        self.state
            .lock()
            .await
            .status_failures
            .insert(container_id.to_string(), times);
    }

    /// Remove a container as if the provider reaped it out-of-band.
    pub async fn reap(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .remove(container_id)
            .is_some()
    }

    pub async fn set_resource_usage(&self, container_id: &str, usage: ResourceUsage) {
        if let Some(c) = self.state.lock().await.containers.get_mut(container_id) {
            c.resource_usage = usage;
        }
    }

    pub async fn set_last_activity(&self, container_id: &str, at: DateTime<Utc>) {
        if let Some(c) = self.state.lock().await.containers.get_mut(container_id) {
            c.last_activity_at = at;
        }
    }

    pub async fn push_log(&self, container_id: &str, message: impl Into<String>) {
        if let Some(c) = self.state.lock().await.containers.get_mut(container_id) {
            c.logs.push(LogLine {
                timestamp: Utc::now(),
                message: message.into(),
                stream: Some("stdout".into()),
            });
        }
    }

    pub async fn status_of(&self, container_id: &str) -> Option<ContainerStatus> {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.status)
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    /// Containers not yet stopped.
    pub async fn live_count(&self) -> usize {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|c| !c.status.is_terminal())
            .count()
    }

    fn metro_url(&self, container_id: &str) -> String {
        match &self.metro_domain {
            Some(domain) => format!("https://{container_id}.{domain}"),
            None => format!("https://{container_id}.preview.localhost"),
        }
    }
}

#[async_trait]
impl ContainerClient for MemoryContainerClient {
    async fn create_container(&self, spec: &ContainerSpec) -> CreateOutcome {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        if let Some(err) = state.fail_next_create.take() {
            return CreateOutcome::Failed(err);
        }

        let container_id = format!("mem-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let delay = state.create_delay.take();
        let now = Utc::now();
        state.containers.insert(
            container_id.clone(),
            MemoryContainer {
                task_id: spec.task_id.clone(),
                status: ContainerStatus::Provisioning,
                started_at: None,
                last_activity_at: now,
                resource_usage: ResourceUsage::default(),
                logs: vec![LogLine {
                    timestamp: now,
                    message: format!("pulling {}", spec.image),
                    stream: Some("stdout".into()),
                }],
            },
        );

        if std::mem::take(&mut state.ambiguous_next_create) {
            return CreateOutcome::Ambiguous {
                reason: "simulated create timeout".into(),
            };
        }
        drop(state);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        CreateOutcome::Created(ProvisionedIds {
            metro_url: self.metro_url(&container_id),
            container_id,
            project_id: None,
            service_id: None,
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<StartReport, ProviderError> {
        let mut state = self.state.lock().await;
        let crash = std::mem::take(&mut state.crash_next_start);
        let c = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        if crash {
            c.status = ContainerStatus::Error;
            c.logs.push(LogLine {
                timestamp: Utc::now(),
                message: "bundler exited with code 1".into(),
                stream: Some("stderr".into()),
            });
        } else if c.status == ContainerStatus::Provisioning {
            let now = Utc::now();
            c.status = ContainerStatus::Running;
            c.started_at = Some(now);
            c.last_activity_at = now;
            c.logs.push(LogLine {
                timestamp: now,
                message: "Metro waiting on port 8081".into(),
                stream: Some("stdout".into()),
            });
        }
        Ok(StartReport { status: c.status })
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let c = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        c.status = ContainerStatus::Stopped;
        Ok(())
    }

    async fn get_container_status(
        &self,
        container_id: &str,
    ) -> Result<StatusReport, ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(remaining) = state.status_failures.get_mut(container_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Http {
                    status: 503,
                    message: "simulated outage".into(),
                });
            }
        }
        let c = state
            .containers
            .get(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        let uptime_seconds = c
            .started_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);
        Ok(StatusReport {
            status: c.status,
            resource_usage: Some(c.resource_usage),
            uptime_seconds,
            last_activity_at: Some(c.last_activity_at),
        })
    }

    async fn get_container_logs(
        &self,
        container_id: &str,
        query: &LogQuery,
    ) -> Result<LogPage, ProviderError> {
        let state = self.state.lock().await;
        let c = state
            .containers
            .get(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        let start = query
            .cursor
            .as_deref()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0)
            .min(c.logs.len());
        let limit = query.limit.unwrap_or(100).max(1) as usize;
        let end = (start + limit).min(c.logs.len());
        let has_more = end < c.logs.len();
        Ok(LogPage {
            logs: c.logs[start..end].to_vec(),
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ProviderContainer>, ProviderError> {
        let state = self.state.lock().await;
        let mut result: Vec<ProviderContainer> = state
            .containers
            .iter()
            .filter(|(_, c)| !c.status.is_terminal())
            .map(|(id, c)| ProviderContainer {
                container_id: id.clone(),
                task_id: Some(c.task_id.clone()),
                status: Some(c.status),
            })
            .collect();
        result.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(result)
    }
}
