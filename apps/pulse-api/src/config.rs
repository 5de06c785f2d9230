use std::time::Duration;

/// Which application service this gateway instance fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Chat,
    Notifications,
    Projects,
}

impl ServiceKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "notifications" => ServiceKind::Notifications,
            "projects" => ServiceKind::Projects,
            "chat" | "" => ServiceKind::Chat,
            other => panic!("SERVICE_KIND must be chat, notifications or projects (got {other})"),
        }
    }

    /// Services that push notifications place every authenticated
    /// connection in its `user:<id>` room.
    pub fn joins_personal_room(self) -> bool {
        matches!(self, ServiceKind::Notifications | ServiceKind::Projects)
    }
}

/// Whether a gateway connection may stay open without a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    Optional,
}

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. Unset means the in-memory entity store.
    pub database_url: Option<String>,
    /// Redis connection string. Unset means in-memory presence and queue.
    pub redis_url: Option<String>,
    /// HMAC secret used to verify bearer JWTs.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    pub service: ServiceKind,
    pub auth_mode: AuthMode,
    /// Number of notification consumer tasks. Zero disables the worker.
    pub notification_workers: usize,
    /// Delivery attempts per notification job before it is dead-lettered.
    pub queue_attempts: u32,
    /// Base retry backoff for notification jobs.
    pub queue_backoff: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: optional_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT").unwrap_or(4010),
            service: ServiceKind::parse(&optional_var("SERVICE_KIND").unwrap_or_default()),
            auth_mode: match optional_var("GATEWAY_AUTH").as_deref() {
                Some("optional") => AuthMode::Optional,
                _ => AuthMode::Required,
            },
            notification_workers: parsed_var("NOTIFICATION_WORKERS").unwrap_or(2),
            queue_attempts: parsed_var("QUEUE_ATTEMPTS").unwrap_or(3),
            queue_backoff: Duration::from_millis(parsed_var("QUEUE_BACKOFF_MS").unwrap_or(1000)),
        }
    }

    /// Defaults for tests and local tooling.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: None,
            redis_url: None,
            jwt_secret: jwt_secret.to_string(),
            port: 0,
            service: ServiceKind::Notifications,
            auth_mode: AuthMode::Required,
            notification_workers: 1,
            queue_attempts: 3,
            queue_backoff: Duration::from_millis(10),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    optional_var(name).and_then(|v| v.parse().ok())
}
