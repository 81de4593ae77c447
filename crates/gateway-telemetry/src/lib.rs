//! # Gateway Telemetry
//!
//! Observability for the resilience engine:
//! - Structured logging with `tracing`
//! - Prometheus metrics for calls, circuits, bulkheads, retries and fallbacks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, provider_span, LoggingConfig, LoggingError, SpanEvents};
pub use metrics::{CircuitBreakerState, ResilienceMetrics};
