use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_QUEUE_NAMESPACE: &str = "medistock:mq";
const DEFAULT_FULFILLMENT_QUEUE: &str = "orders_queue";
const DEFAULT_SEARCH_INDEX: &str = "medicines";

/// Application configuration, loaded from `config/*.toml` plus `APP__`
/// environment overrides.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL (queue broker and cache)
    pub redis_url: String,

    /// JWT secret for verifying bearer tokens issued by the auth service
    pub jwt_secret: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment ("development", "production", ...)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Message queue: key namespace
    #[serde(default = "default_queue_namespace")]
    pub message_queue_namespace: String,

    /// Message queue: fulfillment channel name
    #[serde(default = "default_fulfillment_queue")]
    pub fulfillment_queue: String,

    /// Message queue: consumer block timeout (seconds)
    #[serde(default = "default_queue_block_timeout_secs")]
    pub message_queue_block_timeout_secs: u64,

    /// Message queue: bound on publish round-trips (seconds)
    #[serde(default = "default_publish_timeout_secs")]
    pub message_queue_publish_timeout_secs: u64,

    /// Cache: TTL for per-medicine stock snapshots (seconds)
    #[serde(default = "default_stock_cache_ttl_secs")]
    pub stock_cache_ttl_secs: u64,

    /// Search index: base URL of the Elasticsearch-compatible endpoint.
    /// Empty disables indexing (the index is advisory).
    #[serde(default)]
    pub search_url: Option<String>,

    /// Search index name
    #[serde(default = "default_search_index")]
    pub search_index: String,

    /// Search index: request timeout (seconds)
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,

    /// Reconciliation sweep: re-publish jobs for orders pending longer than
    /// this threshold (seconds)
    #[serde(default = "default_pending_requeue_threshold_secs")]
    pub pending_requeue_threshold_secs: u64,

    /// Reconciliation sweep: interval between sweeps (seconds)
    #[serde(default = "default_pending_sweep_interval_secs")]
    pub pending_sweep_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_queue_namespace() -> String {
    DEFAULT_QUEUE_NAMESPACE.to_string()
}
fn default_fulfillment_queue() -> String {
    DEFAULT_FULFILLMENT_QUEUE.to_string()
}
fn default_queue_block_timeout_secs() -> u64 {
    5
}
fn default_publish_timeout_secs() -> u64 {
    5
}
fn default_stock_cache_ttl_secs() -> u64 {
    3600
}
fn default_search_index() -> String {
    DEFAULT_SEARCH_INDEX.to_string()
}
fn default_search_timeout_secs() -> u64 {
    10
}
fn default_pending_requeue_threshold_secs() -> u64 {
    300
}
fn default_pending_sweep_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Loads configuration in layers: `config/default.toml`, then the
/// environment-specific file, then `APP__*` environment variables.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let config = Config::builder()
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{env}")).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    config.try_deserialize()
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_queue_and_sweep_tuning() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "database_url": "sqlite::memory:",
            "redis_url": "redis://localhost:6379",
            "jwt_secret": "test-secret",
        }))
        .expect("minimal config should deserialize");

        assert_eq!(cfg.fulfillment_queue, DEFAULT_FULFILLMENT_QUEUE);
        assert_eq!(cfg.message_queue_namespace, DEFAULT_QUEUE_NAMESPACE);
        assert_eq!(cfg.message_queue_block_timeout_secs, 5);
        assert_eq!(cfg.stock_cache_ttl_secs, 3600);
        assert_eq!(cfg.pending_requeue_threshold_secs, 300);
        assert!(cfg.is_development());
    }
}
