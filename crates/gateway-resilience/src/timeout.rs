//! Timeout management for protected calls.
//!
//! Two optional deadlines apply: one per raw attempt (innermost, so each retry
//! gets a fresh budget) and one for the whole composed call.

use gateway_config::schema;
use gateway_core::GatewayError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Deadline for each raw attempt
    pub attempt: Option<Duration>,
    /// Deadline for the whole protected call
    pub overall: Option<Duration>,
}

impl From<&schema::TimeoutConfig> for TimeoutConfig {
    fn from(config: &schema::TimeoutConfig) -> Self {
        Self {
            attempt: config.attempt,
            overall: config.overall,
        }
    }
}

/// Timeout manager
#[derive(Debug, Clone, Default)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    /// Create a new timeout manager
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Whether any deadline is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.attempt.is_some() || self.config.overall.is_some()
    }

    /// Run one raw attempt under the attempt deadline
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the attempt deadline passes
    pub async fn attempt<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.with_custom_timeout(future, self.config.attempt).await
    }

    /// Run the whole protected call under the overall deadline
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the overall deadline passes
    pub async fn overall<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.with_custom_timeout(future, self.config.overall).await
    }

    /// Execute an operation with an optional deadline
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the operation times out
    pub async fn with_custom_timeout<F, T>(
        &self,
        future: F,
        timeout: Option<Duration>,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let Some(timeout) = timeout else {
            return future.await;
        };

        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Call timed out");
                Err(GatewayError::timeout(timeout))
            }
        }
    }
}

/// Extension trait for adding timeout to futures
#[allow(async_fn_in_trait)]
pub trait TimeoutExt: Future + Sized {
    /// Add a timeout to this future
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` if the operation times out
    async fn with_timeout(self, timeout: Duration) -> Result<Self::Output, GatewayError>;
}

impl<F: Future> TimeoutExt for F {
    async fn with_timeout(self, timeout: Duration) -> Result<F::Output, GatewayError> {
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| GatewayError::timeout(timeout))
    }
}
