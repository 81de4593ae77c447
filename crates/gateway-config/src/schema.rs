//! Configuration schema definitions.
//!
//! This module defines all configuration types with validation and defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main configuration for the resilience engine
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[derive(Default)]
pub struct GatewayConfig {
    /// Resilience configuration applied to every provider
    #[validate(nested)]
    pub resilience: ResilienceConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Per-provider overrides, keyed by provider id
    #[validate(skip)]
    pub providers: HashMap<String, ProviderOverrides>,
}

impl GatewayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        for overrides in self.providers.values() {
            overrides.validate()?;
        }
        Ok(())
    }

    /// Effective resilience settings for a provider, applying its overrides
    #[must_use]
    pub fn resilience_for(&self, provider: &str) -> ResilienceConfig {
        match self.providers.get(provider) {
            Some(overrides) => overrides.apply(&self.resilience),
            None => self.resilience.clone(),
        }
    }
}

/// Resilience configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[derive(Default)]
pub struct ResilienceConfig {
    /// Circuit breaker configuration
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Bulkhead configuration
    #[validate(nested)]
    pub bulkhead: BulkheadConfig,

    /// Retry configuration
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Fallback configuration
    #[validate(nested)]
    pub fallback: FallbackConfig,

    /// Timeout configuration
    #[validate(nested)]
    pub timeout: TimeoutConfig,

    /// State change event delivery
    #[validate(nested)]
    pub events: EventsConfig,
}

/// Per-provider overrides; absent sections inherit the global settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderOverrides {
    /// Circuit breaker override
    #[validate(nested)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Bulkhead override
    #[validate(nested)]
    pub bulkhead: Option<BulkheadConfig>,

    /// Retry override
    #[validate(nested)]
    pub retry: Option<RetryConfig>,

    /// Fallback override
    #[validate(nested)]
    pub fallback: Option<FallbackConfig>,

    /// Timeout override
    #[validate(nested)]
    pub timeout: Option<TimeoutConfig>,
}

impl ProviderOverrides {
    /// Merge these overrides on top of a base configuration
    #[must_use]
    pub fn apply(&self, base: &ResilienceConfig) -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: self
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| base.circuit_breaker.clone()),
            bulkhead: self.bulkhead.clone().unwrap_or_else(|| base.bulkhead.clone()),
            retry: self.retry.clone().unwrap_or_else(|| base.retry.clone()),
            fallback: self.fallback.clone().unwrap_or_else(|| base.fallback.clone()),
            timeout: self.timeout.clone().unwrap_or_else(|| base.timeout.clone()),
            events: base.events.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether circuit breaker is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures to trip the circuit
    #[validate(range(min = 1, max = 1000))]
    pub failure_threshold: u32,

    /// Consecutive half-open successes to close the circuit
    #[validate(range(min = 1, max = 1000))]
    pub success_threshold: u32,

    /// Time to wait before probing an open circuit
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Concurrent probes admitted while half-open
    #[validate(range(min = 1, max = 1000))]
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
        }
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Whether bulkhead is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum concurrent requests per provider
    #[validate(range(min = 1, max = 10000))]
    pub max_concurrent: u32,

    /// Queue size when max concurrent is reached
    #[validate(range(min = 0, max = 10000))]
    pub max_queue: u32,

    /// Longest a request may wait in the queue
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 10,
            max_queue: 20,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry_backoff"))]
pub struct RetryConfig {
    /// Whether retry is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retries after the first attempt
    #[validate(range(min = 0, max = 20))]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,

    /// Whether to jitter delays
    pub jitter: bool,

    /// Jitter fraction (0.0 - 1.0) applied as +/- around the delay
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_fraction: f64,

    /// Pick backoff presets from the category of each observed error
    pub adaptive: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_fraction: 0.1,
            adaptive: false,
        }
    }
}

fn validate_retry_backoff(config: &RetryConfig) -> Result<(), ValidationError> {
    if config.max_backoff < config.initial_backoff {
        let mut err = ValidationError::new("max_backoff_below_initial");
        err.message = Some("max_backoff must be >= initial_backoff".into());
        return Err(err);
    }
    Ok(())
}

/// Fallback strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategyKind {
    /// Serve a fresh cached response
    Cache,
    /// Serve a cached response past its TTL but within the stale window
    Stale,
    /// Serve the configured degraded response
    Degraded,
    /// Re-surface the original error
    Error,
    /// Delegate to an alternate provider
    Provider,
}

/// Fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_fallback_ttls"))]
pub struct FallbackConfig {
    /// Whether fallback is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Strategies tried in order once the primary call fails
    pub strategies: Vec<FallbackStrategyKind>,

    /// Freshness window of cached responses
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Whether stale entries may be served
    pub enable_stale: bool,

    /// Extended window during which stale entries stay usable
    #[serde(with = "humantime_serde")]
    pub stale_ttl: Duration,

    /// Static payload for the degraded strategy
    pub degraded_response: Option<serde_json::Value>,

    /// Interval of the background cache sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Maximum cached entries per provider
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategies: vec![
                FallbackStrategyKind::Cache,
                FallbackStrategyKind::Provider,
                FallbackStrategyKind::Degraded,
            ],
            cache_ttl: Duration::from_secs(5 * 60),
            enable_stale: true,
            stale_ttl: Duration::from_secs(30 * 60),
            degraded_response: None,
            cleanup_interval: Duration::from_secs(60),
            max_entries: 10_000,
        }
    }
}

fn validate_fallback_ttls(config: &FallbackConfig) -> Result<(), ValidationError> {
    if config.enable_stale && config.stale_ttl < config.cache_ttl {
        let mut err = ValidationError::new("stale_ttl_below_cache_ttl");
        err.message = Some("stale_ttl must be >= cache_ttl".into());
        return Err(err);
    }
    if config.cleanup_interval.is_zero() {
        let mut err = ValidationError::new("zero_cleanup_interval");
        err.message = Some("cleanup_interval must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

/// Timeout configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for each raw attempt (unset = no deadline)
    #[serde(with = "humantime_serde")]
    pub attempt: Option<Duration>,

    /// Deadline for the whole protected call (unset = no deadline)
    #[serde(with = "humantime_serde")]
    pub overall: Option<Duration>,
}

/// State change event delivery
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the bounded state change channel
    #[validate(range(min = 1, max = 100_000))]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[derive(Default)]
pub struct ObservabilityConfig {
    /// Metrics configuration
    #[validate(nested)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    pub enabled: bool,

    /// Histogram buckets for call latency
    #[serde(default = "default_latency_buckets")]
    #[validate(length(min = 1))]
    pub latency_buckets: Vec<f64>,
}

fn default_latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    ]
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_buckets: default_latency_buckets(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[validate(length(min = 1))]
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: LogFormat,

    /// Extra filter directives (e.g. "gateway_resilience=debug")
    pub filter: Option<String>,

    /// Include source file and line
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            filter: None,
            include_location: false,
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogFormat {
    /// JSON formatted logs
    #[default]
    Json,
    /// Human-readable pretty logs
    Pretty,
    /// Compact single-line logs
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!(config.providers.is_empty());
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.half_open_max_requests, 3);
    }

    #[test]
    fn test_bulkhead_config_defaults() {
        let config = BulkheadConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_queue, 20);
        assert_eq!(config.queue_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_secs(10));
        assert!(config.jitter);
        assert!((config.jitter_fraction - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fallback_config_defaults() {
        let config = FallbackConfig::default();
        assert_eq!(
            config.strategies,
            vec![
                FallbackStrategyKind::Cache,
                FallbackStrategyKind::Provider,
                FallbackStrategyKind::Degraded
            ]
        );
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.stale_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_retry_backoff_validation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_ttl_validation() {
        let config = FallbackConfig {
            cache_ttl: Duration::from_secs(600),
            stale_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let disabled = FallbackConfig {
            enable_stale: false,
            ..config
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_provider_overrides() {
        let mut config = GatewayConfig::default();
        config.providers.insert(
            "groq".to_string(),
            ProviderOverrides {
                bulkhead: Some(BulkheadConfig {
                    max_concurrent: 2,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let groq = config.resilience_for("groq");
        assert_eq!(groq.bulkhead.max_concurrent, 2);
        assert_eq!(groq.retry.max_retries, 3);

        let openai = config.resilience_for("openai");
        assert_eq!(openai.bulkhead.max_concurrent, 10);
    }

    #[test]
    fn test_yaml_serialization() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("circuit_breaker:"));
        assert!(yaml.contains("failure_threshold: 5"));
    }

    #[test]
    fn test_strategy_names() {
        let strategy: FallbackStrategyKind = serde_yaml::from_str("stale").expect("deserialize");
        assert_eq!(strategy, FallbackStrategyKind::Stale);

        let strategies: Vec<FallbackStrategyKind> =
            serde_yaml::from_str("[cache, degraded, error]").expect("deserialize");
        assert_eq!(strategies.len(), 3);
    }
}
