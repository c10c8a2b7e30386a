use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use preview_core::container::{Observation, ProvisionedIds};
use preview_core::types::{ContainerStatus, ResourceUsage};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Label carrying the owning task id on every container we create.
pub const TASK_LABEL: &str = "preview.task-id";
/// Label carrying the owning user id.
pub const USER_LABEL: &str = "preview.user-id";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Everything the provider needs to build a bundler container for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub task_id: String,
    pub user_id: String,
    pub image: String,
    pub port: u16,
    /// Hint for provider-side idle reaping.
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn for_task(
        task_id: &str,
        user_id: &str,
        image: &str,
        port: u16,
        idle_timeout_secs: u64,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(TASK_LABEL.to_string(), task_id.to_string());
        labels.insert(USER_LABEL.to_string(), user_id.to_string());
        let mut env = BTreeMap::new();
        env.insert("RCT_METRO_PORT".to_string(), port.to_string());
        env.insert("EXPO_NO_TELEMETRY".to_string(), "1".to_string());
        Self {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            image: image.to_string(),
            port,
            idle_timeout_secs,
            env,
            labels,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of a create call. A create whose outcome is unknown is
/// `Ambiguous`: the container may exist on the provider.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(ProvisionedIds),
    Failed(ProviderError),
    Ambiguous { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: ContainerStatus,
    pub resource_usage: Option<ResourceUsage>,
    pub uptime_seconds: Option<u64>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    pub fn into_observation(self) -> Observation {
        Observation {
            status: self.status,
            resource_usage: self.resource_usage,
            uptime_seconds: self.uptime_seconds,
            last_activity_at: self.last_activity_at,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub logs: Vec<LogLine>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// A container as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContainer {
    pub container_id: String,
    /// `None` for containers we did not label (not ours to touch).
    pub task_id: Option<String>,
    /// `None` when the provider reports a status we do not recognize.
    pub status: Option<ContainerStatus>,
}

/// Map a provider status string onto our lifecycle states.
pub fn parse_status(raw: &str) -> Result<ContainerStatus, ProviderError> {
    match raw.to_ascii_lowercase().as_str() {
        "provisioning" | "pending" | "building" | "deploying" | "starting" | "initializing" => {
            Ok(ContainerStatus::Provisioning)
        }
        "running" | "active" | "healthy" => Ok(ContainerStatus::Running),
        "stopped" | "removed" | "exited" | "sleeping" => Ok(ContainerStatus::Stopped),
        "error" | "failed" | "crashed" => Ok(ContainerStatus::Error),
        other => Err(ProviderError::InvalidResponse(format!(
            "unknown container status '{other}'"
        ))),
    }
}
