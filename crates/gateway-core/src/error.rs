//! Error types shared by provider callers and the resilience patterns.
//!
//! `GatewayError` is the tagged union a provider-calling collaborator returns
//! from a unit of work. The resilience patterns add their own rejection
//! variants so that every failure a caller can observe flows through one type.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using `GatewayError`
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Comprehensive gateway error type covering provider and resilience failures
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request validation failed before reaching the provider
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
        /// Field that failed validation (if applicable)
        field: Option<String>,
    },

    /// Transport-level failure talking to the provider
    #[error("Connection error: {provider} - {message}")]
    Connection {
        /// Provider that could not be reached
        provider: String,
        /// Error message
        message: String,
    },

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimit {
        /// Duration to wait before retrying
        retry_after: Option<Duration>,
        /// Rate limit that was exceeded
        limit: Option<u32>,
    },

    /// Provider error
    #[error("Provider error: {provider} - {message}")]
    Provider {
        /// Provider that returned the error
        provider: String,
        /// Error message
        message: String,
        /// HTTP status code from provider (if applicable)
        status_code: Option<u16>,
    },

    /// Request timed out
    #[error("Request timeout after {duration:?}")]
    Timeout {
        /// Duration after which the request timed out
        duration: Duration,
    },

    /// Circuit breaker is open
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitBreakerOpen {
        /// Provider with open circuit breaker
        provider: String,
    },

    /// Circuit breaker is half-open and its probe budget is exhausted
    #[error("Too many requests while circuit half-open for provider: {provider}")]
    TooManyRequests {
        /// Provider being probed
        provider: String,
    },

    /// Bulkhead has no free slot and its queue is full
    #[error("Bulkhead full for provider: {provider}")]
    BulkheadFull {
        /// Provider whose bulkhead rejected the call
        provider: String,
    },

    /// Request waited in the bulkhead queue longer than allowed
    #[error("Bulkhead queue timeout for provider {provider} after {waited:?}")]
    BulkheadTimeout {
        /// Provider whose bulkhead queue timed out
        provider: String,
        /// Time spent waiting in the queue
        waited: Duration,
    },

    /// A single fallback strategy had nothing to offer
    #[error("No fallback available for provider {provider}: {reason}")]
    NoFallbackAvailable {
        /// Provider the fallback was attempted for
        provider: String,
        /// Why the strategy could not serve a response
        reason: String,
    },

    /// The primary call and every configured fallback strategy failed
    #[error("All fallbacks failed for provider {provider}: {source}")]
    AllFallbacksFailed {
        /// Provider the fallback chain ran for
        provider: String,
        /// Error from the primary call
        #[source]
        source: Box<GatewayError>,
        /// Error from the last strategy attempted
        last: Box<GatewayError>,
    },

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    // Retry decisions live in `gateway_resilience::classifier`

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_failed",
            Self::Connection { .. } => "connection_failed",
            Self::RateLimit { .. } => "rate_limit_exceeded",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::TooManyRequests { .. } => "circuit_breaker_half_open_saturated",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::BulkheadTimeout { .. } => "bulkhead_timeout",
            Self::NoFallbackAvailable { .. } => "no_fallback_available",
            Self::AllFallbacksFailed { .. } => "all_fallbacks_failed",
            Self::Cancelled => "cancelled",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field,
        }
    }

    /// Create a connection error
    #[must_use]
    pub fn connection(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a provider error
    #[must_use]
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a rate limit error
    #[must_use]
    pub fn rate_limit(retry_after: Option<Duration>, limit: Option<u32>) -> Self {
        Self::RateLimit { retry_after, limit }
    }

    /// Create a circuit breaker open error
    #[must_use]
    pub fn circuit_breaker_open(provider: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen {
            provider: provider.into(),
        }
    }

    /// Create a half-open saturation error
    #[must_use]
    pub fn too_many_requests(provider: impl Into<String>) -> Self {
        Self::TooManyRequests {
            provider: provider.into(),
        }
    }

    /// Create a bulkhead full error
    #[must_use]
    pub fn bulkhead_full(provider: impl Into<String>) -> Self {
        Self::BulkheadFull {
            provider: provider.into(),
        }
    }

    /// Create a bulkhead queue timeout error
    #[must_use]
    pub fn bulkhead_timeout(provider: impl Into<String>, waited: Duration) -> Self {
        Self::BulkheadTimeout {
            provider: provider.into(),
            waited,
        }
    }

    /// Create a per-strategy fallback failure
    #[must_use]
    pub fn no_fallback(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoFallbackAvailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Create an aggregated fallback failure
    #[must_use]
    pub fn all_fallbacks_failed(
        provider: impl Into<String>,
        source: GatewayError,
        last: GatewayError,
    ) -> Self {
        Self::AllFallbacksFailed {
            provider: provider.into(),
            source: Box::new(source),
            last: Box::new(last),
        }
    }
}
