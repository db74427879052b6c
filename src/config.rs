use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by configuration validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the pagedrop service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration (admission-control state)
    pub redis: RedisConfig,
    /// Content and quota limits
    pub limits: LimitsConfig,
    /// Admission guard configuration
    pub admission: AdmissionConfig,
    /// API configuration
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
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Object storage configuration (S3-compatible: R2, MinIO, LocalStack)
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket for preview and published content
    pub bucket: String,
    /// Bucket for cover images and other assets
    pub assets_bucket: String,
    /// AWS region ("auto" for R2)
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for R2, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Maximum attempts per object upload
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
    /// Base backoff delay between upload attempts, doubled per retry
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Concurrency limit for per-request upload and copy fan-outs
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
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
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Content and quota limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum total decoded size of a preview bundle in bytes
    #[serde(default = "default_max_bundle_bytes")]
    pub max_bundle_bytes: usize,
    /// Maximum cover image size in kilobytes
    #[serde(default = "default_max_cover_image_kb")]
    pub max_cover_image_kb: usize,
    /// Maximum number of non-deleted artifacts per user
    #[serde(default = "default_max_user_artifacts")]
    pub max_user_artifacts: i64,
    /// Preview time-to-live in hours
    #[serde(default = "default_preview_ttl_hours")]
    pub preview_ttl_hours: i64,
    /// Public domain previews and artifacts are served under
    #[serde(default = "default_app_domain")]
    pub app_domain: String,
}

/// Sliding-window limiter configuration for a route.
///
/// An explicit `Disabled` variant rather than an optional config: a route
/// either carries a window or it does not.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SlidingWindowConfig {
    Enabled {
        /// Requests allowed per identity within the window
        max_requests: u32,
        /// Window length in seconds
        window_secs: u64,
        /// Only limit unauthenticated callers
        #[serde(default)]
        guest_only: bool,
    },
    Disabled,
}

/// Token-bucket limiter configuration for a route (global concurrency)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TokenBucketConfig {
    Enabled {
        /// Bucket capacity (maximum admitted burst)
        capacity: u32,
        /// One token is refilled every this many seconds
        refill_secs: u64,
    },
    Disabled,
}

/// Admission guard configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Per-IP sliding window on preview creation
    #[serde(default = "default_preview_sliding_window")]
    pub preview_sliding_window: SlidingWindowConfig,
    /// Global token bucket on preview creation
    #[serde(default = "default_preview_token_bucket")]
    pub preview_token_bucket: TokenBucketConfig,
    /// Safety TTL for single-flight locks in seconds
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
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
}

// Default value functions
fn default_service_name() -> String {
    "pagedrop".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_transfer_concurrency() -> usize {
    10
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

fn default_run_migrations() -> bool {
    true
}

fn default_max_bundle_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_cover_image_kb() -> usize {
    1000
}

fn default_max_user_artifacts() -> i64 {
    20
}

fn default_preview_ttl_hours() -> i64 {
    24
}

fn default_app_domain() -> String {
    "pagedrop.dev".to_string()
}

fn default_preview_sliding_window() -> SlidingWindowConfig {
    SlidingWindowConfig::Enabled {
        max_requests: 5,
        window_secs: 3600,
        guest_only: false,
    }
}

fn default_preview_token_bucket() -> TokenBucketConfig {
    TokenBucketConfig::Enabled {
        capacity: 10,
        refill_secs: 30,
    }
}

fn default_lock_ttl_secs() -> u64 {
    30
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
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "pagedrop")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/pagedrop").required(false))
            .add_source(config::File::with_name("/etc/pagedrop/pagedrop").required(false))
            // Override with environment variables
            // PAGEDROP__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("PAGEDROP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values the deserializer cannot reject on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.bucket.is_empty() {
            return Err(ConfigError::MissingRequired("storage.bucket".to_string()));
        }
        if self.storage.assets_bucket.is_empty() {
            return Err(ConfigError::MissingRequired(
                "storage.assets_bucket".to_string(),
            ));
        }
        if self.storage.upload_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage.upload_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.storage.transfer_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage.transfer_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let SlidingWindowConfig::Enabled {
            max_requests,
            window_secs,
            ..
        } = &self.admission.preview_sliding_window
        {
            if *max_requests == 0 || *window_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "admission.preview_sliding_window".to_string(),
                    message: "max_requests and window_secs must be positive".to_string(),
                });
            }
        }
        if let TokenBucketConfig::Enabled {
            capacity,
            refill_secs,
        } = &self.admission.preview_token_bucket
        {
            if *capacity == 0 || *refill_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "admission.preview_token_bucket".to_string(),
                    message: "capacity and refill_secs must be positive".to_string(),
                });
            }
        }
        if self.limits.preview_ttl_hours <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "limits.preview_ttl_hours".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get single-flight lock TTL as Duration
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.admission.lock_ttl_secs)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            storage: StorageConfig {
                bucket: "pagedrop-content".to_string(),
                assets_bucket: "pagedrop-assets".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                upload_attempts: default_upload_attempts(),
                backoff_base_secs: default_backoff_base_secs(),
                transfer_concurrency: default_transfer_concurrency(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/pagedrop".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: true,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            limits: LimitsConfig {
                max_bundle_bytes: default_max_bundle_bytes(),
                max_cover_image_kb: default_max_cover_image_kb(),
                max_user_artifacts: default_max_user_artifacts(),
                preview_ttl_hours: default_preview_ttl_hours(),
                app_domain: default_app_domain(),
            },
            admission: AdmissionConfig {
                preview_sliding_window: default_preview_sliding_window(),
                preview_token_bucket: default_preview_token_bucket(),
                lock_ttl_secs: default_lock_ttl_secs(),
            },
            api: ApiConfig {
                host: default_api_host(),
                port: default_api_port(),
                cors_enabled: true,
                cors_origins: vec![],
            },
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_bundle_bytes(), 10 * 1024 * 1024);
        assert_eq!(default_max_user_artifacts(), 20);
        assert_eq!(default_preview_ttl_hours(), 24);
        assert_eq!(default_lock_ttl_secs(), 30);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = test_config();
        config.storage.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = test_config();
        config.admission.preview_sliding_window = SlidingWindowConfig::Enabled {
            max_requests: 5,
            window_secs: 0,
            guest_only: false,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_disabled_guards_valid() {
        let mut config = test_config();
        config.admission.preview_sliding_window = SlidingWindowConfig::Disabled;
        config.admission.preview_token_bucket = TokenBucketConfig::Disabled;
        assert!(config.validate().is_ok());
    }
}
