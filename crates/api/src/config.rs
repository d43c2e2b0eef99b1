use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub kafka: KafkaConfig,
    pub exports: ExportsConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port serving the user-facing API.
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Port serving the callbacks used by upstream applications.
    #[serde(default = "default_private_port")]
    pub private_port: u16,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_public_base_path")]
    pub public_base_path: String,

    #[serde(default = "default_private_base_path")]
    pub private_base_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    #[serde(default)]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn pool_config(&self) -> persistence::db::DatabaseConfig {
        persistence::db::DatabaseConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            connect_timeout_secs: self.connect_timeout_secs,
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// S3-compatible endpoint (MinIO, Ceph, AWS).
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_upload_part_size")]
    pub upload_part_size_mib: u64,

    #[serde(default = "default_download_part_size")]
    pub download_part_size_mib: u64,
}

impl StorageConfig {
    pub fn upload_part_size(&self) -> usize {
        (self.upload_part_size_mib * MIB) as usize
    }

    pub fn download_part_size(&self) -> u64 {
        self.download_part_size_mib * MIB
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Kafka,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bus_backend")]
    pub backend: BusBackend,

    #[serde(default)]
    pub brokers: Vec<String>,

    #[serde(default = "default_announce_topic")]
    pub announce_topic: String,

    /// Capacity of the publisher's outbound channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl KafkaConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportsConfig {
    #[serde(default = "default_expiry_days")]
    pub default_expiry_days: i64,

    #[serde(default = "default_expiry_sweep_minutes")]
    pub expiry_sweep_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Pre-shared keys accepted on the internal API.
    #[serde(default)]
    pub psks: Vec<String>,
}

const MIB: u64 = 1024 * 1024;

/// S3 rejects multipart parts smaller than this, except the last one.
const MIN_PART_SIZE_MIB: u64 = 5;

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_public_port() -> u16 {
    8000
}
fn default_private_port() -> u16 {
    10010
}
fn default_metrics_port() -> u16 {
    9000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_public_base_path() -> String {
    "/api/export/v1".to_string()
}
fn default_private_base_path() -> String {
    "/app/export/v1".to_string()
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Postgres
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::S3
}
fn default_bucket() -> String {
    "exports-bucket".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_upload_part_size() -> u64 {
    10
}
fn default_download_part_size() -> u64 {
    100
}
fn default_bus_backend() -> BusBackend {
    BusBackend::Kafka
}
fn default_announce_topic() -> String {
    "platform.export.requests".to_string()
}
fn default_channel_capacity() -> usize {
    100
}
fn default_max_delivery_attempts() -> u32 {
    5
}
fn default_flush_timeout_ms() -> u64 {
    1500
}
fn default_message_timeout_ms() -> u64 {
    5000
}
fn default_expiry_days() -> i64 {
    domain::models::DEFAULT_EXPIRY_DAYS
}
fn default_expiry_sweep_minutes() -> u64 {
    60
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Embedded defaults used by tests and by local tooling without a config directory.
const TEST_DEFAULTS: &str = r#"
    [server]
    host = "127.0.0.1"
    public_port = 8000
    private_port = 10010
    metrics_port = 9000
    request_timeout_secs = 30
    shutdown_grace_secs = 1
    public_base_path = "/api/export/v1"
    private_base_path = "/app/export/v1"

    [database]
    backend = "memory"
    url = ""

    [logging]
    level = "info"
    format = "pretty"

    [storage]
    backend = "memory"
    bucket = "exports-test"
    upload_part_size_mib = 5
    download_part_size_mib = 5

    [kafka]
    backend = "memory"
    brokers = []
    announce_topic = "platform.export.requests"
    channel_capacity = 16
    max_delivery_attempts = 3
    flush_timeout_ms = 200

    [exports]
    default_expiry_days = 7
    expiry_sweep_minutes = 60

    [security]
    psks = ["testing-a-psk"]
"#;

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with EXPORTS__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("EXPORTS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.psks")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Load configuration for testing with custom overrides.
    ///
    /// Built entirely from embedded defaults with in-memory backends, so no
    /// config files, database or brokers are needed.
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(TEST_DEFAULTS, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "EXPORTS__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        let ports = [
            self.server.public_port,
            self.server.private_port,
            self.server.metrics_port,
        ];
        if ports.contains(&0) {
            return Err(ConfigValidationError::InvalidValue(
                "Server ports cannot be 0".to_string(),
            ));
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(ConfigValidationError::InvalidValue(
                "public, private and metrics ports must differ".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        if self.storage.backend == StorageBackendKind::S3 {
            if self.storage.bucket.is_empty() {
                return Err(ConfigValidationError::MissingRequired(
                    "storage.bucket".to_string(),
                ));
            }
            if self.storage.upload_part_size_mib < MIN_PART_SIZE_MIB
                || self.storage.download_part_size_mib < MIN_PART_SIZE_MIB
            {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "storage part sizes must be at least {} MiB",
                    MIN_PART_SIZE_MIB
                )));
            }
        }

        if self.kafka.backend == BusBackend::Kafka && self.kafka.brokers.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "kafka.brokers".to_string(),
            ));
        }
        if self.kafka.max_delivery_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "kafka.max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.kafka.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "kafka.channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.exports.default_expiry_days < 1 {
            return Err(ConfigValidationError::InvalidValue(
                "exports.default_expiry_days must be at least 1".to_string(),
            ));
        }

        if self.security.psks.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigValidationError::MissingRequired(
                "at least one entry in security.psks".to_string(),
            ));
        }

        Ok(())
    }

    fn addr(&self, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, port).parse()
    }

    pub fn public_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.addr(self.server.public_port)
    }

    pub fn private_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.addr(self.server.private_port)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.addr(self.server.metrics_port)
    }
}
