//! REST handlers for task CRUD and execution logs.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use chronai_types::{ScheduleType, Task, TaskDraft, TaskPatch};

use crate::GatewayState;

/// Task representation returned by the API. The credential only ever
/// appears masked.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: i64,
    pub name: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub schedule_type: ScheduleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_time: Option<String>,
    pub message_content: String,
    pub model: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskView {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            api_endpoint: task.api_endpoint.clone(),
            api_key: chronai_security::mask(&task.api_key),
            schedule_type: task.schedule_type,
            interval_minutes: task.interval_minutes,
            interval_seconds: task.interval_seconds,
            fixed_time: task.fixed_time.clone(),
            message_content: task.message_content.clone(),
            model: task.model.clone(),
            enabled: task.enabled,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

fn validation_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "task not found"})),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!("Internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}

/// Bearer-token gate for the `/api` routes.
pub async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    match crate::authorize(state.auth_token.as_deref(), request.headers()) {
        Ok(()) => next.run(request).await,
        Err(status) => status.into_response(),
    }
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/tasks — create a task, register its job, and (for enabled
/// interval tasks) fire one immediate execution.
pub async fn create_task(
    State(state): State<Arc<GatewayState>>,
    Json(draft): Json<TaskDraft>,
) -> Response {
    if let Err(e) = draft.validate() {
        return validation_error(e);
    }

    let encrypted = match state.cipher.encrypt(&draft.api_key) {
        Ok(ciphertext) => ciphertext,
        Err(e) => return internal_error(e),
    };

    let task = match state.store.create_task(draft.into_new_task(encrypted)).await {
        Ok(task) => task,
        Err(e) => return internal_error(e),
    };

    // The row is now the source of truth; registration problems are the
    // scheduler's to log.
    state.scheduler.notify_saved(&task).await;

    (StatusCode::CREATED, Json(TaskView::from_task(&task))).into_response()
}

/// GET /api/tasks
pub async fn list_tasks(State(state): State<Arc<GatewayState>>) -> Response {
    match state.store.list_tasks().await {
        Ok(tasks) => {
            let views: Vec<TaskView> = tasks.iter().map(TaskView::from_task).collect();
            Json(views).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.store.get_task(id).await {
        Ok(Some(task)) => Json(TaskView::from_task(&task)).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal_error(e),
    }
}

/// PUT /api/tasks/{id} — partial update. A provided api_key is encrypted
/// before the merge; the merged task is re-validated before persisting.
pub async fn update_task(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
    Json(mut patch): Json<TaskPatch>,
) -> Response {
    let mut task = match state.store.get_task(id).await {
        Ok(Some(task)) => task,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };

    if let Some(plain) = patch.api_key.take() {
        match state.cipher.encrypt(&plain) {
            Ok(ciphertext) => patch.api_key = Some(ciphertext),
            Err(e) => return internal_error(e),
        }
    }

    patch.apply(&mut task);
    if let Err(e) = task.validate() {
        return validation_error(e);
    }

    match state.store.update_task(task.clone()).await {
        Ok(true) => {}
        Ok(false) => return not_found(),
        Err(e) => return internal_error(e),
    }

    state.scheduler.notify_saved(&task).await;

    Json(TaskView::from_task(&task)).into_response()
}

/// DELETE /api/tasks/{id} — unregister the job, then drop the row (its
/// execution logs cascade with it).
pub async fn delete_task(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
) -> Response {
    state.scheduler.unregister(id).await;

    match state.store.delete_task(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: u32,
}

fn default_log_limit() -> u32 {
    50
}

/// GET /api/tasks/{id}/logs — newest first.
pub async fn list_logs(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.store.get_task(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    }

    match state.store.list_logs(id, query.limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal_error(e),
    }
}
