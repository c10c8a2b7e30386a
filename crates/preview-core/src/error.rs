use thiserror::Error;

use crate::types::ContainerStatus;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("task {task_id} already has an active container ({container_id})")]
    ActiveContainerExists {
        task_id: String,
        container_id: String,
    },

    #[error("invalid container transition from {from} to {to}")]
    InvalidTransition {
        from: ContainerStatus,
        to: ContainerStatus,
    },

    #[error("invalid platform '{0}': expected web, mobile, ios or android")]
    InvalidPlatform(String),

    #[error("invalid task id '{0}': must be 1-128 characters of [A-Za-z0-9_-]")]
    InvalidTaskId(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PreviewError>;
