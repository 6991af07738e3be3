//! imgsim Configuration Management
//!
//! Handles configuration from environment variables and TOML files,
//! with sensible defaults for local development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Model serving endpoint
    pub model: ModelConfig,

    /// Worker pool and job lifecycle
    pub dispatcher: DispatcherConfig,

    /// Similarity ranking behavior
    pub ranking: RankingConfig,

    /// Embedding store persistence
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_vars(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overwrite every setting whose variable `lookup` returns
    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        // Model serving
        if let Some(url) = lookup("IMGSIM_MODEL_URL") {
            self.model.base_url = url;
        }
        if let Some(name) = lookup("IMGSIM_MODEL_NAME") {
            self.model.model_name = name;
        }
        if let Some(dim) = lookup("IMGSIM_VECTOR_DIMENSION") {
            self.model.dimension = parse_var("IMGSIM_VECTOR_DIMENSION", dim)?;
        }
        if let Some(secs) = lookup("IMGSIM_MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_var("IMGSIM_MODEL_TIMEOUT_SECS", secs)?;
        }

        // Dispatcher
        if let Some(workers) = lookup("IMGSIM_WORKERS") {
            self.dispatcher.workers = parse_var("IMGSIM_WORKERS", workers)?;
        }
        if let Some(capacity) = lookup("IMGSIM_QUEUE_CAPACITY") {
            self.dispatcher.queue_capacity = parse_var("IMGSIM_QUEUE_CAPACITY", capacity)?;
        }
        if let Some(secs) = lookup("IMGSIM_RETENTION_SECS") {
            self.dispatcher.retention_secs = parse_var("IMGSIM_RETENTION_SECS", secs)?;
        }
        if let Some(secs) = lookup("IMGSIM_JOB_TIMEOUT_SECS") {
            self.dispatcher.job_timeout_secs = Some(parse_var("IMGSIM_JOB_TIMEOUT_SECS", secs)?);
        }

        // Ranking
        if let Some(policy) = lookup("IMGSIM_RANKING_POLICY") {
            self.ranking.policy = policy.parse()?;
        }

        // Store
        if let Some(path) = lookup("IMGSIM_STORE_PATH") {
            self.store.snapshot_path = Some(PathBuf::from(path));
        }

        // Logging
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("LOG_JSON") {
            self.logging.json_format = parse_var("LOG_JSON", json)?;
        }

        Ok(())
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    ///
    /// Only variables that are actually set replace file values.
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "model.dimension".to_string(),
                value: "0".to_string(),
            });
        }
        if self.dispatcher.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatcher.workers".to_string(),
                value: "0".to_string(),
            });
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatcher.queue_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if self.dispatcher.poll_max_ms < self.dispatcher.poll_initial_ms {
            return Err(ConfigError::InvalidValue {
                key: "dispatcher.poll_max_ms".to_string(),
                value: self.dispatcher.poll_max_ms.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Model serving endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the serving endpoint
    pub base_url: String,

    /// Model name in the predict path
    pub model_name: String,

    /// Length of the feature vectors the model produces
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ModelConfig {
    /// Full predict URL, e.g. `http://host:8501/v1/models/name:predict`
    pub fn predict_url(&self) -> String {
        format!(
            "{}/v1/models/{}:predict",
            self.base_url.trim_end_matches('/'),
            self.model_name
        )
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8501".to_string(),
            model_name: "feature_extractor".to_string(),
            dimension: 1280, // MobileNetV2 pooled features
            timeout_secs: 30,
        }
    }
}

/// Worker pool and job lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker tasks
    pub workers: usize,

    /// Maximum number of queued jobs before submissions are rejected
    pub queue_capacity: usize,

    /// How long a finished job stays fetchable (seconds)
    pub retention_secs: u64,

    /// First wait interval while polling a job (milliseconds)
    pub poll_initial_ms: u64,

    /// Upper bound for the poll backoff (milliseconds)
    pub poll_max_ms: u64,

    /// Default deadline for orchestrated jobs; `None` waits indefinitely
    pub job_timeout_secs: Option<u64>,
}

impl DispatcherConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 256,
            retention_secs: 300,
            poll_initial_ms: 10,
            poll_max_ms: 500,
            job_timeout_secs: Some(60),
        }
    }
}

/// How matches sharing an owner are reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingPolicy {
    /// One entry per stored embedding; an owner may repeat
    #[default]
    PerEmbedding,
    /// One entry per owner, keeping its best score
    DistinctOwner,
}

impl std::str::FromStr for RankingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_embedding" => Ok(Self::PerEmbedding),
            "distinct_owner" | "distinct" => Ok(Self::DistinctOwner),
            _ => Err(ConfigError::InvalidValue {
                key: "IMGSIM_RANKING_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Similarity ranking configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub policy: RankingPolicy,
}

/// Embedding store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot loaded on start and written on shutdown
    pub snapshot_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl From<ConfigError> for crate::ImgsimError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
