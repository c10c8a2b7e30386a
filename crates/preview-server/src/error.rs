use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use preview_core::PreviewError;
use preview_provider::ProviderError;

use crate::lifecycle::{LifecycleError, PROVISION_FAILED_MESSAGE};

// ---------------------------------------------------------------------------
// Sentinels carried through the anyhow chain
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

fn preview_status(e: &PreviewError) -> StatusCode {
    match e {
        PreviewError::TaskNotFound(_) | PreviewError::ContainerNotFound(_) => StatusCode::NOT_FOUND,
        PreviewError::TaskExists(_) | PreviewError::ActiveContainerExists { .. } => {
            StatusCode::CONFLICT
        }
        PreviewError::InvalidPlatform(_) | PreviewError::InvalidTaskId(_) => {
            StatusCode::BAD_REQUEST
        }
        PreviewError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PreviewError::Store(_)
        | PreviewError::InvalidConfig(_)
        | PreviewError::Io(_)
        | PreviewError::Yaml(_)
        | PreviewError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn provider_status(e: &ProviderError) -> StatusCode {
    match e {
        ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
        ProviderError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(e) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": e.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
        if let Some(e) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": e.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }

        let (status, message) = if let Some(e) = self.0.downcast_ref::<LifecycleError>() {
            match e {
                LifecycleError::TaskNotFound(_) | LifecycleError::ContainerNotFound(_) => {
                    (StatusCode::NOT_FOUND, e.to_string())
                }
                LifecycleError::NotMobile { .. } => (StatusCode::BAD_REQUEST, e.to_string()),
                LifecycleError::ProvisioningFailed { .. }
                | LifecycleError::Ambiguous { .. }
                | LifecycleError::StartFailed { .. }
                | LifecycleError::Persistence { .. } => {
                    (StatusCode::BAD_GATEWAY, PROVISION_FAILED_MESSAGE.to_string())
                }
                LifecycleError::Monitoring { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                LifecycleError::Provider(p) => (provider_status(p), e.to_string()),
                LifecycleError::Store(p) => (preview_status(p), e.to_string()),
                LifecycleError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        } else if let Some(e) = self.0.downcast_ref::<PreviewError>() {
            (preview_status(e), e.to_string())
        } else if let Some(e) = self.0.downcast_ref::<ProviderError>() {
            (provider_status(e), e.to_string())
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = ?self.0, "request failed");
        }
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
