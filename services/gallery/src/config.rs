use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the gallery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Image store configuration
    #[serde(default)]
    pub images: ImagesConfig,
    /// Database configuration (in-memory repositories when absent)
    pub database: Option<DatabaseConfig>,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Health probe configuration
    #[serde(default)]
    pub health: HealthConfig,
    /// Startup behaviour
    #[serde(default)]
    pub startup: StartupConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic the comment producer publishes to
    #[serde(default = "default_comments_topic")]
    pub comments_topic: String,
    /// Routing key carried as the message key for new comments
    #[serde(default = "default_comments_routing_key")]
    pub comments_routing_key: String,
    /// Maximum number of handler invocations in flight
    #[serde(default = "default_handler_concurrency")]
    pub handler_concurrency: usize,
    /// Let the broker client commit offsets
    #[serde(default = "default_true")]
    pub enable_auto_commit: bool,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
}

/// Image store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    /// Directory that holds uploaded image bytes
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    /// Upload transfers running at once within a single create call
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Save an image record after each completed transfer
    #[serde(default)]
    pub link_metadata: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Request body limit for uploads, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Health probe configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// URL probed by `/health`; status is unknown when unset
    pub probe_url: Option<String>,
    /// Probe request timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

/// Startup behaviour
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartupConfig {
    /// Wipe the upload directory and all comment records before serving
    #[serde(default)]
    pub reset_on_startup: bool,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "gallery-service".to_string()
}

fn default_comments_topic() -> String {
    "gallery".to_string()
}

fn default_comments_routing_key() -> String {
    "comments.new".to_string()
}

fn default_handler_concurrency() -> usize {
    16
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("upload-dir")
}

fn default_upload_concurrency() -> usize {
    8
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "gallery-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/gallery/gallery").required(false))
            // GALLERY__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get health probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            upload_concurrency: default_upload_concurrency(),
            link_metadata: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}
