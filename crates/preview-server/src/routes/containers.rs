use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use preview_provider::{LogPage, LogQuery};
use serde::Deserialize;

use crate::auth::Session;
use crate::error::AppError;
use crate::lifecycle::{MonitorSnapshot, Provisioned};
use crate::state::AppState;

const MAX_LOG_LIMIT: u32 = 500;

/// POST /api/tasks/:task_id/container: Provision (or return) the task's
/// bundler container.
pub async fn provision_container(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
) -> Result<Json<Provisioned>, AppError> {
    let provisioned = app
        .lifecycle
        .provision_container(&task_id, &session.user_id, session.admin)
        .await?;
    Ok(Json(provisioned))
}

/// GET /api/tasks/:task_id/container: Poll the provider and return the
/// resource usage snapshot.
pub async fn container_status(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
) -> Result<Json<MonitorSnapshot>, AppError> {
    let row = app
        .lifecycle
        .task_container(&task_id, &session.user_id, session.admin)
        .await?;
    let snapshot = app.lifecycle.monitor_container(&row.container_id).await?;
    Ok(Json(snapshot))
}

/// DELETE /api/tasks/:task_id/container: Explicit stop.
pub async fn stop_container(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
) -> Result<Json<MonitorSnapshot>, AppError> {
    let row = app
        .lifecycle
        .task_container(&task_id, &session.user_id, session.admin)
        .await?;
    let snapshot = app
        .lifecycle
        .stop_container(&row.container_id, "stopped by user")
        .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

/// GET /api/tasks/:task_id/container/logs?limit=&cursor=
pub async fn container_logs(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogPage>, AppError> {
    let query = LogQuery {
        limit: params.limit.map(|l| l.clamp(1, MAX_LOG_LIMIT)),
        cursor: params.cursor,
    };
    let page = app
        .lifecycle
        .container_logs(&task_id, &session.user_id, session.admin, query)
        .await?;
    Ok(Json(page))
}
