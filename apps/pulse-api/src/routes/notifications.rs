//! Notification history for the calling user.

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::models::notification::Notification;
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/{notification_id}/seen", patch(mark_seen))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// GET /api/v1/notifications
// ---------------------------------------------------------------------------

pub async fn list_notifications(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let notifications = state
        .entities
        .list_notifications(&actor.sub, limit)
        .await?;
    Ok(Json(notifications))
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/notifications/:notification_id/seen
// ---------------------------------------------------------------------------

pub async fn mark_seen(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    state
        .entities
        .mark_notification_seen(&actor.sub, &notification_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Notification not found"))
}
