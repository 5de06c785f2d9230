use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use pulse_common::RoomId;
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, FieldError};
use crate::models::project::Task;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/projects/{project_id}/tasks/{task_id}/assign",
        post(assign_task),
    )
}

#[derive(Debug, Deserialize)]
pub struct TaskPath {
    pub project_id: String,
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskRequest {
    pub assignee_id: Option<String>,
}

/// Only project members may act on a project.
pub(crate) async fn require_project_member(
    state: &AppState,
    project_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    if state
        .entities
        .find_membership(&RoomId::project(project_id), user_id)
        .await?
    {
        Ok(())
    } else {
        Err(ApiError::forbidden("You are not a member of this project"))
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/projects/:project_id/tasks/:task_id/assign
// ---------------------------------------------------------------------------

pub async fn assign_task(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(path): Path<TaskPath>,
    Json(body): Json<AssignTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let Some(assignee_id) = body.assignee_id.filter(|id| !id.trim().is_empty()) else {
        return Err(ApiError::validation(vec![FieldError {
            field: "assigneeId".to_string(),
            message: "Assignee is required".to_string(),
        }]));
    };

    require_project_member(&state, &path.project_id, &actor.sub).await?;

    let task = state
        .entities
        .assign_task(&path.project_id, &path.task_id, &assignee_id)
        .await?;
    let _ = state.producer.task_assigned(&actor, &task).await;

    Ok(Json(task))
}
