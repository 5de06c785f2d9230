pub mod follows;
pub mod health;
pub mod members;
pub mod notifications;
pub mod posts;
pub mod tasks;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            posts::router()
                .merge(follows::router())
                .merge(tasks::router())
                .merge(members::router())
                .merge(notifications::router()),
        )
}
