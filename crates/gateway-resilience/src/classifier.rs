//! Error classification for retry and adaptive backoff decisions.

use gateway_core::GatewayError;
use serde::Serialize;
use std::fmt;

/// Coarse category of a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport failure reaching the provider
    Network,
    /// The call or one of its stages ran out of time
    Timeout,
    /// Provider throttled the request
    RateLimit,
    /// Provider failed with a 5xx
    ServerError,
    /// Request was rejected as invalid (4xx)
    ClientError,
    /// Rejected by an open or saturated circuit breaker
    CircuitOpen,
    /// Rejected by a saturated bulkhead
    BulkheadFull,
    /// Anything else
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category are worth retrying
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::ClientError | Self::Unknown)
    }

    /// Stable label for logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::CircuitOpen => "circuit_open",
            Self::BulkheadFull => "bulkhead_full",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_PHRASES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "no such host",
    "dns",
    "network is unreachable",
    "host is unreachable",
    "unexpected eof",
    "tls handshake",
];

const TIMEOUT_PHRASES: &[&str] = &["timed out", "timeout", "deadline exceeded"];

/// Map an error to its category
#[must_use]
pub fn classify(error: &GatewayError) -> ErrorCategory {
    match error {
        GatewayError::Connection { .. } => ErrorCategory::Network,
        GatewayError::Timeout { .. } => ErrorCategory::Timeout,
        GatewayError::RateLimit { .. } => ErrorCategory::RateLimit,
        GatewayError::Provider {
            status_code: Some(code),
            ..
        } => match *code {
            429 => ErrorCategory::RateLimit,
            408 | 504 => ErrorCategory::Timeout,
            500..=599 => ErrorCategory::ServerError,
            400..=499 => ErrorCategory::ClientError,
            _ => ErrorCategory::Unknown,
        },
        GatewayError::Provider {
            message,
            status_code: None,
            ..
        } => classify_message(message),
        GatewayError::CircuitBreakerOpen { .. } | GatewayError::TooManyRequests { .. } => {
            ErrorCategory::CircuitOpen
        }
        GatewayError::BulkheadFull { .. } | GatewayError::BulkheadTimeout { .. } => {
            ErrorCategory::BulkheadFull
        }
        GatewayError::Validation { .. } => ErrorCategory::ClientError,
        GatewayError::AllFallbacksFailed { source, .. } => classify(source),
        GatewayError::NoFallbackAvailable { .. }
        | GatewayError::Cancelled
        | GatewayError::Configuration { .. }
        | GatewayError::Internal { .. } => ErrorCategory::Unknown,
    }
}

/// Whether the error should be retried under the default policy
#[must_use]
pub fn is_retryable(error: &GatewayError) -> bool {
    classify(error).is_retryable()
}

fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    if NETWORK_PHRASES.iter().any(|phrase| message.contains(phrase)) {
        ErrorCategory::Network
    } else if TIMEOUT_PHRASES.iter().any(|phrase| message.contains(phrase)) {
        ErrorCategory::Timeout
    } else {
        ErrorCategory::Unknown
    }
}
