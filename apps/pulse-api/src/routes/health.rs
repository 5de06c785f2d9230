use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::outcome::BestEffort;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `ok` or `degraded`; presence and typing run without the store.
    pub store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match BestEffort::from_result(state.kv.ping().await, "health.ping") {
        BestEffort::Ok(()) => "ok",
        BestEffort::Degraded => "degraded",
    };
    Json(HealthResponse { status: "ok", store })
}
