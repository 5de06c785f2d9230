use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pulse_common::RoomId;
use serde::{Deserialize, Serialize};

use super::tasks::require_project_member;
use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, FieldError};
use crate::models::project::ProjectMember;
use crate::AppState;

const ROLES: &[&str] = &["admin", "member", "viewer"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{project_id}/members", post(add_member))
        .route("/projects/{project_id}/invites", post(invite_member))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponse {
    pub project_id: String,
    pub user_id: String,
    pub invited_by: String,
}

// ---------------------------------------------------------------------------
// POST /api/v1/projects/:project_id/members
// ---------------------------------------------------------------------------

pub async fn add_member(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<ProjectMember>), ApiError> {
    let mut errors = Vec::new();
    let user_id = body.user_id.unwrap_or_default();
    if user_id.trim().is_empty() {
        errors.push(FieldError {
            field: "userId".to_string(),
            message: "User is required".to_string(),
        });
    }
    let role = body.role.unwrap_or_else(|| "member".to_string());
    if !ROLES.contains(&role.as_str()) {
        errors.push(FieldError {
            field: "role".to_string(),
            message: format!("Role must be one of: {}", ROLES.join(", ")),
        });
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    require_project_member(&state, &project_id, &actor.sub).await?;

    let member = state
        .entities
        .add_project_member(&project_id, &user_id, &role)
        .await?;
    let _ = state.producer.member_added(&actor, &member).await;

    Ok((StatusCode::CREATED, Json(member)))
}

// ---------------------------------------------------------------------------
// POST /api/v1/projects/:project_id/invites
// ---------------------------------------------------------------------------

/// Invite a user to a project. Membership is granted separately; the invite
/// lives on as the invitee's notification.
pub async fn invite_member(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), ApiError> {
    let user_id = body.user_id.unwrap_or_default().trim().to_string();
    if user_id.is_empty() {
        return Err(ApiError::validation(vec![FieldError {
            field: "userId".to_string(),
            message: "User is required".to_string(),
        }]));
    }

    require_project_member(&state, &project_id, &actor.sub).await?;

    if state.entities.get_user(&user_id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    if state
        .entities
        .find_membership(&RoomId::project(&project_id), &user_id)
        .await?
    {
        return Err(ApiError::conflict("User is already a member of this project"));
    }

    let _ = state
        .producer
        .project_invite(&actor, &project_id, &user_id)
        .await;

    Ok((
        StatusCode::CREATED,
        Json(InviteResponse {
            project_id,
            user_id,
            invited_by: actor.sub,
        }),
    ))
}
