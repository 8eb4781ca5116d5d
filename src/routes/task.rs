//! Task status route handlers

use crate::error::{AppError, AppResult};
use crate::models::Task;
use crate::state::SharedState;
use crate::task::scheduler::TaskLiveStatus;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub success: bool,
    pub task: Task,
    #[serde(flatten)]
    pub live: TaskLiveStatus,
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> AppResult<Json<TaskStatusResponse>> {
    let task = state
        .store
        .find_task(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {} not found", id)))?;
    let live = state.scheduler.status(&task).await;

    Ok(Json(TaskStatusResponse {
        success: true,
        task,
        live,
    }))
}
