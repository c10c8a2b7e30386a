use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PreviewError;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Mobile,
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::Mobile => "mobile",
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// Platforms served by a remote Metro bundler container.
    pub fn needs_bundler(self) -> bool {
        !matches!(self, Platform::Web)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Platform::Web),
            "mobile" => Ok(Platform::Mobile),
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(PreviewError::InvalidPlatform(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ContainerStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a remote bundler container row.
///
/// Transitions: `Provisioning → Running → Stopped | Error`, and
/// `Provisioning → Stopped | Error` when a container never came up.
/// `Stopped` and `Error` are terminal for the row; a new provision creates a
/// new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Provisioning,
    Running,
    Stopped,
    Error,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Provisioning => "provisioning",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Error)
    }

    /// Whether a row in `self` may move to `next`.
    ///
    /// Re-applying the same non-terminal status is allowed so monitoring polls
    /// can refresh resource snapshots.
    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        match (self, next) {
            (Provisioning, _) => true,
            (Running, Running | Stopped | Error) => true,
            (Running, Provisioning) => false,
            (Stopped | Error, _) => false,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResourceUsage
// ---------------------------------------------------------------------------

/// Point-in-time resource snapshot reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilisation in percent.
    pub cpu: f64,
    /// Resident memory in MB.
    pub ram: f64,
    /// Network throughput in KB/s.
    #[serde(default)]
    pub network: f64,
}
