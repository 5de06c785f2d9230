use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/users/{user_id}/follow", post(follow_user))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowResponse {
    pub follower_id: String,
    pub followee_id: String,
}

// ---------------------------------------------------------------------------
// POST /api/v1/users/:user_id/follow
// ---------------------------------------------------------------------------

pub async fn follow_user(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<FollowResponse>), ApiError> {
    if user_id == actor.sub {
        return Err(ApiError::bad_request("You cannot follow yourself"));
    }

    state.entities.follow_user(&actor.sub, &user_id).await?;
    let _ = state.producer.user_followed(&actor, &user_id).await;

    Ok((
        StatusCode::CREATED,
        Json(FollowResponse {
            follower_id: actor.sub,
            followee_id: user_id,
        }),
    ))
}
