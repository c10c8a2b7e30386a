use crate::error::{PreviewError, Result};
use crate::types::{Platform, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub sandbox_url: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, platform: Platform) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            platform,
            sandbox_url: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Visible to `user_id` when not soft-deleted and owned by them.
    /// Admin callers skip the ownership half of the check.
    pub fn is_visible_to(&self, user_id: &str, admin: bool) -> bool {
        !self.is_deleted() && (admin || self.user_id == user_id)
    }
}

/// Task ids come from the URL path and become redb keys, so keep them tame.
pub fn validate_task_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PreviewError::InvalidTaskId(id.to_string()))
    }
}

/// Generate a task id of the form `task-<8 hex chars>`.
pub fn generate_task_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}", &id[..8])
}
