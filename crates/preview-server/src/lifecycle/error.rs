use preview_core::types::{ContainerStatus, Platform};
use preview_core::PreviewError;
use preview_provider::ProviderError;
use thiserror::Error;

/// User-facing text for any provisioning failure; the cause is logged.
pub const PROVISION_FAILED_MESSAGE: &str = "failed to start mobile preview, please retry";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} targets {platform}, which has no bundler container")]
    NotMobile { task_id: String, platform: Platform },

    #[error("failed to start mobile preview, please retry")]
    ProvisioningFailed {
        task_id: String,
        #[source]
        source: ProviderError,
    },

    /// The provider may or may not have created a container.
    #[error("failed to start mobile preview, please retry")]
    Ambiguous { task_id: String, reason: String },

    /// The container was created but went terminal instead of starting.
    #[error("failed to start mobile preview, please retry")]
    StartFailed {
        task_id: String,
        container_id: String,
        status: ContainerStatus,
    },

    /// The provider created a container but its row could not be written.
    #[error("failed to start mobile preview, please retry")]
    Persistence {
        container_id: String,
        #[source]
        source: PreviewError,
    },

    #[error("could not reach provider for container {container_id} after {attempts} attempts")]
    Monitoring {
        container_id: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] PreviewError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    /// Map store lookups that mean "not visible" onto the lifecycle variant.
    pub(crate) fn from_lookup(err: PreviewError) -> Self {
        match err {
            PreviewError::TaskNotFound(id) => LifecycleError::TaskNotFound(id),
            other => LifecycleError::Store(other),
        }
    }
}
