//! # Gateway Resilience
//!
//! Per-provider fault tolerance for the LLM Inference Gateway:
//! - Error classification into retry-relevant categories
//! - Circuit breaker for preventing cascading failures
//! - Bulkhead with a bounded wait queue for resource isolation
//! - Retry policy with exponential backoff and category presets
//! - Fallback to cached, stale or degraded responses
//! - Timeout management
//! - A manager composing all of the above per provider

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod classifier;
pub mod events;
pub mod fallback;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod timeout;
pub mod workers;

// Re-export main types
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use classifier::{classify, ErrorCategory};
pub use events::{EventPublisher, StateChangeCallback, StateChangeEvent};
pub use fallback::{Fallback, FallbackCallback, FallbackConfig, FallbackStats, FallbackStrategy};
pub use manager::{
    HealthReport, ProviderFallbackCallback, ProviderHealth, ProviderStats, ResilienceManager,
    ResilienceStats,
};
pub use registry::KeyedRegistry;
pub use retry::{RetryConfig, RetryPolicy, RetryPredicate, RetryResult};
pub use timeout::{TimeoutConfig, TimeoutExt, TimeoutManager};
pub use workers::BackgroundWorkers;
