use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider does not recognize the container id. Authoritative.
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("provider returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    /// Worth retrying: the provider may answer differently a moment later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Http { .. } | ProviderError::Network(_) | ProviderError::Timeout(_)
        )
    }
}
