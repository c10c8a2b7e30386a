use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use preview_core::container::RemoteContainer;
use preview_core::task::{generate_task_id, validate_task_id, Task};
use preview_core::types::{ContainerStatus, Platform, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::with_store;
use crate::auth::Session;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub sandbox_url: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskView {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            user_id: t.user_id,
            platform: t.platform,
            sandbox_url: t.sandbox_url,
            status: t.status,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    pub id: Uuid,
    pub container_id: String,
    pub metro_url: String,
    pub status: ContainerStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl From<RemoteContainer> for ContainerView {
    fn from(c: RemoteContainer) -> Self {
        Self {
            id: c.id,
            container_id: c.container_id,
            metro_url: c.metro_url,
            status: c.status,
            status_reason: c.status_reason,
            created_at: c.created_at,
            stopped_at: c.stopped_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskBody {
    #[serde(default)]
    pub id: Option<String>,
    pub platform: String,
    #[serde(default)]
    pub sandbox_url: Option<String>,
}

/// POST /api/tasks: Create a task; bundler platforms provision a container
/// before the response is sent.
pub async fn create_task(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let platform: Platform = body.platform.parse()?;
    let id = body.id.unwrap_or_else(generate_task_id);
    validate_task_id(&id)?;

    let mut task = Task::new(&id, &session.user_id, platform);
    task.sandbox_url = body.sandbox_url;
    let to_insert = task.clone();
    with_store(&app, move |s| s.insert_task(&to_insert)).await?;
    tracing::info!(task_id = %id, platform = %platform, user_id = %session.user_id, "task created");

    let container = if platform.needs_bundler() {
        let provisioned = app
            .lifecycle
            .provision_container(&id, &session.user_id, session.admin)
            .await?;
        Some(provisioned)
    } else {
        None
    };

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "task": TaskView::from(task),
            "container": container,
        })),
    ))
}

/// GET /api/tasks: Tasks visible to the caller (all tasks for admins).
pub async fn list_tasks(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = (!session.admin).then(|| session.user_id.clone());
    let tasks = with_store(&app, move |s| s.list_tasks(user.as_deref())).await?;
    let tasks: Vec<TaskView> = tasks.into_iter().map(TaskView::from).collect();
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

/// GET /api/tasks/:task_id: Task record plus its latest container row.
pub async fn get_task(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (task, container) = with_store(&app, move |s| {
        let task = s.find_task(&task_id, &session.user_id, session.admin)?;
        let container = s.latest_container_for_task(&task.id)?;
        Ok((task, container))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "task": TaskView::from(task),
        "container": container.map(ContainerView::from),
    })))
}

/// DELETE /api/tasks/:task_id: Soft delete and tear down the container.
pub async fn delete_task(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = task_id.clone();
    let task = with_store(&app, move |s| {
        s.soft_delete_task(&id, &session.user_id, session.admin)
    })
    .await?;

    // The task is gone either way; a failed stop is left to the idle sweep.
    let container = match app.lifecycle.teardown_task(&task.id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "teardown failed after delete");
            None
        }
    };

    Ok(Json(serde_json::json!({
        "taskId": task.id,
        "deleted": true,
        "container": container,
    })))
}
