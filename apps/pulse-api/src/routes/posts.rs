//! Comment and like endpoints. Both notify the post author.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, FieldError};
use crate::models::post::Comment;
use crate::AppState;

const MAX_COMMENT_CHARS: usize = 2000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts/{post_id}/comments", post(create_comment))
        .route("/posts/{post_id}/likes", post(like_post))
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeResponse {
    pub post_id: String,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// POST /api/v1/posts/:post_id/comments
// ---------------------------------------------------------------------------

pub async fn create_comment(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Json(body): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<Comment>), ApiError> {
    let content = body.content.as_deref().map(str::trim).unwrap_or_default();
    if content.is_empty() {
        return Err(ApiError::validation(vec![FieldError {
            field: "content".to_string(),
            message: "Comment content is required".to_string(),
        }]));
    }
    if content.chars().count() > MAX_COMMENT_CHARS {
        return Err(ApiError::validation(vec![FieldError {
            field: "content".to_string(),
            message: format!("Comment content must be {MAX_COMMENT_CHARS} characters or fewer"),
        }]));
    }

    let created = state
        .entities
        .create_comment(&post_id, &actor.sub, content)
        .await?;

    // Notification is best-effort; the comment already exists.
    let _ = state
        .producer
        .comment_posted(&actor, &created.post_author_id, &created.comment)
        .await;

    Ok((StatusCode::CREATED, Json(created.comment)))
}

// ---------------------------------------------------------------------------
// POST /api/v1/posts/:post_id/likes
// ---------------------------------------------------------------------------

pub async fn like_post(
    AuthUser(actor): AuthUser,
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<(StatusCode, Json<LikeResponse>), ApiError> {
    let author_id = state.entities.like_post(&post_id, &actor.sub).await?;
    let _ = state.producer.post_liked(&actor, &author_id, &post_id).await;

    Ok((
        StatusCode::CREATED,
        Json(LikeResponse {
            post_id,
            user_id: actor.sub,
        }),
    ))
}
