//! Configuration loading from files and environment.
//!
//! This module provides configuration loading from YAML, TOML and JSON files,
//! with support for environment variable substitution and overrides.

use crate::schema::GatewayConfig;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path to the file that was not found
        path: String,
    },

    /// IO error
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Unsupported format
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// The file extension that was not supported
        extension: String,
    },

    /// An environment override could not be parsed
    #[error("Invalid value for {name}: {value}")]
    InvalidOverride {
        /// The environment variable name
        name: String,
        /// The rejected value
        value: String,
    },
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path
    File(String),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            env_prefix: None,
        }
    }

    /// Add a configuration source
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<String>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Set environment variable prefix for overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from all sources
    ///
    /// Later sources replace earlier ones wholesale.
    ///
    /// # Errors
    /// Returns error if any source fails to load or validate
    pub async fn load(self) -> Result<GatewayConfig, ConfigError> {
        let mut config = GatewayConfig::default();

        for source in self.sources {
            config = Self::load_source(&source).await?;
        }

        if let Some(ref prefix) = self.env_prefix {
            config = Self::apply_env_overrides(config, prefix)?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!(
            providers = config.providers.len(),
            "Resilience configuration loaded"
        );
        Ok(config)
    }

    async fn load_source(source: &ConfigSource) -> Result<GatewayConfig, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => Self::parse_yaml(&Self::substitute_env_vars(content)),
            ConfigSource::Toml(content) => Self::parse_toml(&Self::substitute_env_vars(content)),
            ConfigSource::Json(content) => Self::parse_json(&Self::substitute_env_vars(content)),
            ConfigSource::Default => Ok(GatewayConfig::default()),
        }
    }

    async fn load_file(path: &str) -> Result<GatewayConfig, ConfigError> {
        let path = Path::new(path);

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = Self::substitute_env_vars(&content);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => Self::parse_yaml(&content),
            "toml" => Self::parse_toml(&content),
            "json" => Self::parse_json(&content),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    fn parse_yaml(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn parse_toml(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn parse_json(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Substitute environment variables in content
    ///
    /// Supports ${VAR} and ${VAR:-default} syntax. Unknown variables without a
    /// default are left untouched and logged.
    #[allow(clippy::expect_used)]
    fn substitute_env_vars(content: &str) -> String {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid regex");

        re.replace_all(content, |caps: &regex::Captures<'_>| {
            let var_spec = &caps[1];
            let (var_name, default) = match var_spec.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_spec, None),
            };

            match (std::env::var(var_name), default) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => {
                    warn!(variable = %var_name, "Environment variable not found");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
    }

    /// Apply `<PREFIX>_*` environment variable overrides
    fn apply_env_overrides(
        mut config: GatewayConfig,
        prefix: &str,
    ) -> Result<GatewayConfig, ConfigError> {
        let resilience = &mut config.resilience;

        if let Some(v) = env_parse::<bool>(prefix, "CIRCUIT_BREAKER_ENABLED")? {
            resilience.circuit_breaker.enabled = v;
        }
        if let Some(v) = env_parse::<u32>(prefix, "CIRCUIT_BREAKER_FAILURE_THRESHOLD")? {
            resilience.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env_duration(prefix, "CIRCUIT_BREAKER_TIMEOUT")? {
            resilience.circuit_breaker.timeout = v;
        }
        if let Some(v) = env_parse::<bool>(prefix, "BULKHEAD_ENABLED")? {
            resilience.bulkhead.enabled = v;
        }
        if let Some(v) = env_parse::<u32>(prefix, "BULKHEAD_MAX_CONCURRENT")? {
            resilience.bulkhead.max_concurrent = v;
        }
        if let Some(v) = env_parse::<u32>(prefix, "BULKHEAD_MAX_QUEUE")? {
            resilience.bulkhead.max_queue = v;
        }
        if let Some(v) = env_parse::<bool>(prefix, "RETRY_ENABLED")? {
            resilience.retry.enabled = v;
        }
        if let Some(v) = env_parse::<u32>(prefix, "RETRY_MAX_RETRIES")? {
            resilience.retry.max_retries = v;
        }
        if let Some(v) = env_parse::<bool>(prefix, "FALLBACK_ENABLED")? {
            resilience.fallback.enabled = v;
        }
        if let Some(v) = env_duration(prefix, "FALLBACK_CACHE_TTL")? {
            resilience.fallback.cache_ttl = v;
        }

        if let Ok(level) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            config.observability.logging.level = level;
        }
        if let Some(v) = env_parse::<bool>(prefix, "METRICS_ENABLED")? {
            config.observability.metrics.enabled = v;
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>, ConfigError> {
    let name = format!("{prefix}_{key}");
    match std::env::var(&name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride { name, value }),
        Err(_) => Ok(None),
    }
}

fn env_duration(prefix: &str, key: &str) -> Result<Option<Duration>, ConfigError> {
    let name = format!("{prefix}_{key}");
    match std::env::var(&name) {
        Ok(value) => {
            let parsed: Result<Duration, _> =
                serde_yaml::from_str::<HumanDuration>(&value).map(|d| d.0);
            parsed
                .map(Some)
                .map_err(|_| ConfigError::InvalidOverride { name, value })
        }
        Err(_) => Ok(None),
    }
}

#[derive(serde::Deserialize)]
struct HumanDuration(#[serde(with = "humantime_serde")] Duration);

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from RESILIENCE_CONFIG_PATH environment variable
/// 2. ./resilience.yaml
/// 3. ./config/resilience.yaml
/// 4. /etc/llm-gateway/resilience.yaml
///
/// # Errors
/// Returns error if a configuration file is found but fails to parse or validate
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    let config_path = std::env::var("RESILIENCE_CONFIG_PATH").ok();

    let search_paths = if let Some(ref path) = config_path {
        vec![path.as_str()]
    } else {
        vec![
            "resilience.yaml",
            "resilience.yml",
            "resilience.toml",
            "config/resilience.yaml",
            "config/resilience.toml",
            "/etc/llm-gateway/resilience.yaml",
        ]
    };

    for path in &search_paths {
        if Path::new(path).exists() {
            info!(path = %path, "Loading resilience configuration");
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix("LLM_GATEWAY")
                .load()
                .await;
        }
    }

    warn!("No resilience configuration file found, using defaults");
    ConfigLoader::new()
        .with_source(ConfigSource::Default)
        .with_env_prefix("LLM_GATEWAY")
        .load()
        .await
}
