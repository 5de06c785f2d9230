use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_api::config::Config;
use pulse_api::db::entity::EntityStore;
use pulse_api::db::kv::{EphemeralStore, MemoryStore, PURGE_INTERVAL};
use pulse_api::db::memory::MemoryEntityStore;
use pulse_api::db::postgres::PgEntityStore;
use pulse_api::db::redis::RedisStore;
use pulse_api::notify::job::NOTIFICATION_QUEUE;
use pulse_api::notify::queue::{MemoryQueue, QueueTransport};
use pulse_api::notify::redis_queue::RedisQueue;
use pulse_api::notify::NotificationWorker;
use pulse_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let workers = config.notification_workers;

    let entities: Arc<dyn EntityStore> = match &config.database_url {
        Some(url) => Arc::new(PgEntityStore::new(pulse_api::db::pool::connect(url).await)),
        None => {
            tracing::warn!("DATABASE_URL unset, using the in-memory entity store");
            Arc::new(MemoryEntityStore::new())
        }
    };

    let mut purger = None;
    let (kv, queue): (Arc<dyn EphemeralStore>, Arc<dyn QueueTransport>) = match &config.redis_url
    {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .expect("failed to connect to redis");
            let queue = RedisQueue::new(store.connection());
            match queue.recover_stalled(NOTIFICATION_QUEUE).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(recovered = n, "requeued stalled notification jobs"),
                Err(e) => tracing::warn!(error = %e, "stalled job recovery failed"),
            }
            (Arc::new(store), Arc::new(queue))
        }
        None => {
            tracing::warn!("REDIS_URL unset, presence and queue are process-local");
            let store = Arc::new(MemoryStore::new());
            purger = Some(store.clone().spawn_purger(PURGE_INTERVAL));
            (store, Arc::new(MemoryQueue::new()))
        }
    };

    tracing::info!(
        service = ?config.service,
        auth_mode = ?config.auth_mode,
        workers,
        "pulse-api configured"
    );

    let state = AppState::build(config, entities, kv, queue).expect("gateway event table");

    let consumers = (workers > 0).then(|| {
        Arc::new(NotificationWorker::new(
            state.entities.clone(),
            state.gateway.clone(),
        ))
        .spawn(state.queue.clone(), workers)
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(pulse_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "pulse-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if let Some(consumers) = consumers {
        consumers.shutdown().await;
    }
    if let Some(purger) = purger {
        purger.stop().await;
    }
    tracing::info!("pulse-api stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
