//! # Gateway Configuration
//!
//! Configuration for the per-provider resilience engine, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files
//! - Environment variable substitution and overrides
//! - Per-provider overrides layered on the global defaults

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource};
pub use schema::{
    BulkheadConfig, CircuitBreakerConfig, EventsConfig, FallbackConfig, FallbackStrategyKind,
    GatewayConfig, LogFormat, LoggingConfig, MetricsConfig, ObservabilityConfig,
    ProviderOverrides, ResilienceConfig, RetryConfig, TimeoutConfig,
};
