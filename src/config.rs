//! Configuration surface consumed by the core.
//!
//! The wider deployment (process supervisor, ops tooling) is responsible for
//! loading this from the environment; the core only ever sees the resulting
//! struct.

#[derive(Clone, Debug)]
pub struct Config {
    /// Gate unauthenticated REQ/EVENT behind a NIP-42 challenge.
    pub auth_required: bool,
    /// When `auth_required` is set, allow reads without auth anyway.
    pub public_readable: bool,
    pub max_filters_per_req: usize,
    pub max_limit: usize,
    /// Used to bind AUTH challenges to this relay.
    pub service_url: String,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_addr: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub store_op_timeout_secs: u64,
}

impl Config {
    /// Load configuration from the environment, optionally backed by a
    /// `.env` file. `DATABASE_URL` is required; everything else has a
    /// default.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let port = std::env::var("RELAY_PORT").unwrap_or_else(|_| "3001".to_string());

        Config {
            auth_required: env_bool("AUTH_REQUIRED", false),
            public_readable: env_bool("PUBLIC_READABLE", true),
            max_filters_per_req: env_usize("MAX_FILTERS_PER_REQ", 10),
            max_limit: env_usize("MAX_LIMIT", 500),
            service_url: std::env::var("SERVICE_URL")
                .unwrap_or_else(|_| "wss://localhost:3001".to_string()),
            database_url,
            redis_url: std::env::var("REDIS_URL").ok(),
            bind_addr: format!("0.0.0.0:{port}"),
            outbound_queue_capacity: env_usize("OUTBOUND_QUEUE_CAPACITY", 256),
            idle_timeout_secs: env_u64("IDLE_TIMEOUT_SECS", 28),
            ping_interval_secs: env_u64("PING_INTERVAL_SECS", 10),
            store_op_timeout_secs: env_u64("STORE_OP_TIMEOUT_SECS", 10),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
