pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod outcome;
pub mod routes;

use std::sync::Arc;

use auth::tokens::{CredentialVerifier, JwtVerifier};
use config::Config;
use db::entity::EntityStore;
use db::kv::EphemeralStore;
use gateway::handler::{HandlerTable, TableError};
use gateway::presence::{PresenceTracker, TypingTracker};
use gateway::unread::UnreadCounter;
use gateway::Gateway;
use notify::queue::{JobOptions, QueueTransport};
use notify::NotificationProducer;

/// Shared application state available to all route and gateway handlers.
#[derive(Clone)]
pub struct AppState {
    pub entities: Arc<dyn EntityStore>,
    pub kv: Arc<dyn EphemeralStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub gateway: Arc<Gateway>,
    pub typing: TypingTracker,
    pub unread: UnreadCounter,
    pub producer: NotificationProducer,
    pub queue: Arc<dyn QueueTransport>,
    pub handlers: Arc<HandlerTable>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the gateway, trackers and producer over the given backends.
    ///
    /// Fails only if the gateway event table is inconsistent.
    pub fn build(
        config: Config,
        entities: Arc<dyn EntityStore>,
        kv: Arc<dyn EphemeralStore>,
        queue: Arc<dyn QueueTransport>,
    ) -> Result<Self, TableError> {
        let handlers = Arc::new(gateway::handler::routes()?);
        let gateway = Arc::new(Gateway::new(
            entities.clone(),
            PresenceTracker::new(kv.clone()),
            config.service.joins_personal_room(),
        ));
        let options = JobOptions {
            attempts: config.queue_attempts,
            backoff: config.queue_backoff,
        };
        let producer = NotificationProducer::new(queue.clone(), gateway.clone(), options);

        Ok(Self {
            verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
            typing: TypingTracker::new(kv.clone()),
            unread: UnreadCounter::new(kv.clone()),
            entities,
            kv,
            gateway,
            producer,
            queue,
            handlers,
            config: Arc::new(config),
        })
    }
}
