use crate::core::errors::ConfigError;
use crate::core::types::QualityBands;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Server configuration for the management binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Cloud provider configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Keys seeded into an empty pool on first start (comma-separated in env)
    pub seed_api_keys: Vec<String>,
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub probe_prompt: String,
}

/// Credential pool policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    /// Error count at which a credential leaves the rotation
    pub failure_threshold: u32,
}

/// Recognition controller configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub quality_bands: QualityBands,
    /// How many credentials one test may try for its cloud pass
    pub cloud_credential_attempts: usize,
    pub cloud_prompt: String,
}

/// Translation cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: String,
    pub default_ttl_days: u32,
    /// Zero disables background persistence
    pub save_interval: Duration,
}

/// Model switch debounce configuration
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
}

/// Durable settings storage
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub settings_file: PathBuf,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub pool: PoolConfig,
    pub recognition: RecognitionConfig,
    pub cache: CacheConfig,
    pub debounce: DebounceConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 1420,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            api: ApiConfig {
                seed_api_keys: Vec::new(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                request_timeout: Duration::from_secs(60),
                max_retries: 2,
                probe_prompt: "Reply with the single word OK.".to_string(),
            },
            pool: PoolConfig {
                capacity: 5,
                failure_threshold: 3,
            },
            recognition: RecognitionConfig {
                quality_bands: QualityBands::default(),
                cloud_credential_attempts: 1,
                cloud_prompt: "Extract all text from this document image. \
                               Preserve line breaks and reading order. \
                               Output only the extracted text."
                    .to_string(),
            },
            cache: CacheConfig {
                cache_dir: ".cache".to_string(),
                default_ttl_days: 30,
                save_interval: Duration::from_secs(30),
            },
            debounce: DebounceConfig {
                quiet_period: Duration::from_millis(300),
            },
            storage: StorageConfig {
                settings_file: PathBuf::from(".cache/settings.json"),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let defaults = Self::default();

        let seed_api_keys = env::var("GEMINI_API_KEYS")
            .ok()
            .map(|keys| {
                keys.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(defaults.server.log_level);

        let cache_dir = env::var("CACHE_DIR").unwrap_or(defaults.cache.cache_dir);
        let settings_file = env::var("SETTINGS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(&cache_dir).join("settings.json"));

        let quality_bands = QualityBands {
            excellent: env_parse("QUALITY_EXCELLENT_MIN")
                .unwrap_or(defaults.recognition.quality_bands.excellent),
            good: env_parse("QUALITY_GOOD_MIN").unwrap_or(defaults.recognition.quality_bands.good),
            fair: env_parse("QUALITY_FAIR_MIN").unwrap_or(defaults.recognition.quality_bands.fair),
        };

        Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT").unwrap_or(defaults.server.port),
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                log_level,
            },
            api: ApiConfig {
                seed_api_keys,
                base_url: env::var("GEMINI_BASE_URL").unwrap_or(defaults.api.base_url),
                request_timeout: env_parse("API_TIMEOUT_SECONDS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.api.request_timeout),
                max_retries: env_parse("MAX_RETRIES").unwrap_or(defaults.api.max_retries),
                probe_prompt: defaults.api.probe_prompt,
            },
            pool: PoolConfig {
                capacity: env_parse("KEY_POOL_CAPACITY").unwrap_or(defaults.pool.capacity),
                failure_threshold: env_parse("KEY_FAILURE_THRESHOLD")
                    .unwrap_or(defaults.pool.failure_threshold),
            },
            recognition: RecognitionConfig {
                quality_bands,
                cloud_credential_attempts: env_parse("CLOUD_CREDENTIAL_ATTEMPTS")
                    .unwrap_or(defaults.recognition.cloud_credential_attempts),
                cloud_prompt: defaults.recognition.cloud_prompt,
            },
            cache: CacheConfig {
                cache_dir,
                default_ttl_days: env_parse("CACHE_TTL_DAYS")
                    .unwrap_or(defaults.cache.default_ttl_days),
                save_interval: env_parse("CACHE_SAVE_INTERVAL_SECONDS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cache.save_interval),
            },
            debounce: DebounceConfig {
                quiet_period: env_parse("MODEL_SWITCH_DEBOUNCE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.debounce.quiet_period),
            },
            storage: StorageConfig { settings_file },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.capacity == 0 {
            return Err(ConfigError::InvalidPoolCapacity(self.pool.capacity));
        }

        if self.pool.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(self.pool.failure_threshold));
        }

        let bands = &self.recognition.quality_bands;
        if !bands.is_valid() {
            return Err(ConfigError::InvalidQualityBands(format!(
                "excellent={} good={} fair={}",
                bands.excellent, bands.good, bands.fair
            )));
        }

        if self.recognition.cloud_credential_attempts == 0 {
            return Err(ConfigError::InvalidRecognitionConfig(
                "cloud_credential_attempts must be > 0".to_string(),
            ));
        }

        if self.cache.default_ttl_days == 0 {
            return Err(ConfigError::InvalidCacheConfig(
                "default_ttl_days must be > 0".to_string(),
            ));
        }

        // Validate cache directory parent exists
        let cache_path = Path::new(&self.cache.cache_dir);
        if let Some(parent) = cache_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidStoragePath(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }
}
