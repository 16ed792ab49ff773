use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the processor service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Inference engine configuration
    pub engine: EngineConfig,
    /// Batch pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Trigger API configuration
    #[serde(default)]
    pub api: ApiConfig,
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
    /// Expose Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 source bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding device uploads
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Top-level key segment above `<serial>/<date>/`
    #[serde(default = "default_key_root")]
    pub key_root: String,
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

/// Detection engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Inference server endpoint accepting folder requests
    pub url: String,
    /// Minimum detection confidence passed to the model
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Maximum detections per image passed to the model
    #[serde(default = "default_max_detections")]
    pub max_detections: u32,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// When the remote copy of an image is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDeletePolicy {
    /// Right after the local download succeeds
    AfterDownload,
    /// Once the image's frame has been stored or skipped
    #[default]
    AfterPersist,
}

/// Batch pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Device serial processed by the scheduler
    #[serde(default = "default_device_serial")]
    pub device_serial: String,
    /// Tenant/user tag written with every record
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Parent directory for per-batch scratch directories
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    /// Remote object deletion policy
    #[serde(default)]
    pub remote_delete: RemoteDeletePolicy,
}

/// Scheduler cadence
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run the polling loop
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target period between batch starts in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Minimum wait between batches in milliseconds
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
}

/// API configuration for the trigger endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the trigger API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "keypose-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "ap-northeast-2".to_string()
}

fn default_key_root() -> String {
    "opencv".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_confidence_threshold() -> f32 {
    0.3
}

fn default_max_detections() -> u32 {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_device_serial() -> String {
    "SFRXC12515GF00001".to_string()
}

fn default_user_id() -> String {
    "default".to_string()
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_min_wait_ms() -> u64 {
    100
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(config::File::with_name("/etc/keypose/processor").required(false))
            // Override with environment variables
            // PROCESSOR__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("PROCESSOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde defaults cannot guarantee
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        if self.engine.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("engine.url".to_string()));
        }
        if self.pipeline.device_serial.trim().is_empty() {
            return Err(ConfigError::MissingRequired("pipeline.device_serial".to_string()));
        }

        if !(0.0..=1.0).contains(&self.engine.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "engine.confidence_threshold".to_string(),
                message: format!("{} is outside [0, 1]", self.engine.confidence_threshold),
            });
        }
        if self.engine.max_detections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.max_detections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.tick_interval_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_serial: default_device_serial(),
            user_id: default_user_id(),
            scratch_root: default_scratch_root(),
            remote_delete: RemoteDeletePolicy::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            min_wait_ms: default_min_wait_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            s3: S3Config {
                bucket: "device-uploads".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                key_root: default_key_root(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/keypose".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: true,
            },
            engine: EngineConfig {
                url: "http://localhost:8000/predict".to_string(),
                confidence_threshold: default_confidence_threshold(),
                max_detections: default_max_detections(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_confidence_threshold(), 0.3);
        assert_eq!(default_max_detections(), 1);
        assert_eq!(default_key_root(), "opencv");
        assert_eq!(SchedulerConfig::default().tick_interval(), Duration::from_secs(1));
        assert_eq!(SchedulerConfig::default().min_wait(), Duration::from_millis(100));
        assert_eq!(PipelineConfig::default().remote_delete, RemoteDeletePolicy::AfterPersist);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let mut config = valid_config();
        config.s3.bucket = " ".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "s3.bucket"
        ));
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let mut config = valid_config();
        config.engine.confidence_threshold = 1.5;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "engine.confidence_threshold"
        ));
    }

    #[test]
    fn test_zero_max_detections_rejected() {
        let mut config = valid_config();
        config.engine.max_detections = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_delete_policy_deserializes() {
        let policy: RemoteDeletePolicy = serde_json::from_str("\"after_download\"").unwrap();
        assert_eq!(policy, RemoteDeletePolicy::AfterDownload);
    }
}
