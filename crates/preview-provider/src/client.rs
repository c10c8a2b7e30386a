use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{
    ContainerSpec, CreateOutcome, LogPage, LogQuery, ProviderContainer, StartReport, StatusReport,
};

/// Adapter contract for a remote container platform.
///
/// Every method is callable cold, with nothing but the provider container id
/// persisted from an earlier process.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Create (but not necessarily start) a bundler container.
    async fn create_container(&self, spec: &ContainerSpec) -> CreateOutcome;

    /// Start a container. Starting a running container reports its status.
    async fn start_container(&self, container_id: &str) -> Result<StartReport, ProviderError>;

    /// Stop a container. Unknown ids are `NotFound`, which callers treat as
    /// already stopped.
    async fn stop_container(&self, container_id: &str) -> Result<(), ProviderError>;

    /// Read-only status poll.
    async fn get_container_status(&self, container_id: &str)
        -> Result<StatusReport, ProviderError>;

    /// One page of recent logs. An empty page is not an error.
    async fn get_container_logs(
        &self,
        container_id: &str,
        query: &LogQuery,
    ) -> Result<LogPage, ProviderError>;

    /// Every container the provider runs for us.
    async fn list_containers(&self) -> Result<Vec<ProviderContainer>, ProviderError>;
}
