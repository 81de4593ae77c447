//! Retry logic with exponential backoff and jitter.

use crate::classifier::{self, ErrorCategory};
use gateway_config::schema;
use gateway_core::{GatewayError, GatewayResult};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Whether to jitter delays
    pub jitter: bool,
    /// Jitter fraction (0.0 to 1.0) applied as +/- around the delay
    pub jitter_fraction: f64,
    /// Let the category of each error pick the backoff preset
    pub adaptive: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
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

impl From<&schema::RetryConfig> for RetryConfig {
    fn from(config: &schema::RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff.max(config.initial_backoff),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter,
            jitter_fraction: config.jitter_fraction.clamp(0.0, 1.0),
            adaptive: config.adaptive,
        }
    }
}

impl RetryConfig {
    /// Preset tuned for a category of error
    ///
    /// Network blips retry fast, rate limits back off hard, and pattern
    /// rejections get a single slow retry. Client errors are never retried.
    #[must_use]
    pub fn for_category(category: ErrorCategory) -> Self {
        let base = Self::default();
        match category {
            ErrorCategory::Network => Self {
                max_retries: 3,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(2),
                backoff_multiplier: 1.5,
                ..base
            },
            ErrorCategory::RateLimit => Self {
                max_retries: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                backoff_multiplier: 3.0,
                ..base
            },
            ErrorCategory::CircuitOpen | ErrorCategory::BulkheadFull => Self {
                max_retries: 1,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(1),
                backoff_multiplier: 1.0,
                ..base
            },
            ErrorCategory::Timeout => Self {
                max_retries: 2,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                ..base
            },
            ErrorCategory::ServerError => base,
            ErrorCategory::ClientError | ErrorCategory::Unknown => Self {
                max_retries: 0,
                ..base
            },
        }
    }

    /// Un-jittered delay before retry number `attempt + 1`
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    fn delay_for(&self, attempt: u32, error: &GatewayError) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();

        let mut delay = if self.jitter && self.jitter_fraction > 0.0 {
            let range = base * self.jitter_fraction;
            (base + rand::thread_rng().gen_range(-range..=range)).max(0.0)
        } else {
            base
        };

        if let GatewayError::RateLimit {
            retry_after: Some(hint),
            ..
        } = error
        {
            delay = delay.max(hint.min(&self.max_backoff).as_secs_f64());
        }

        Duration::from_secs_f64(delay)
    }
}

/// Decides whether an error deserves another attempt
pub type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

/// Outcome of a retried call with bookkeeping
#[derive(Debug)]
pub struct RetryResult<T> {
    /// Final result
    pub result: GatewayResult<T>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

impl<T> RetryResult<T> {
    /// Retries performed after the first attempt
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Retry policy with exponential backoff
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    checker: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy that retries what the classifier deems retryable
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            checker: Arc::new(classifier::is_retryable),
        }
    }

    /// Replace the retryable predicate
    #[must_use]
    pub fn with_checker<P>(mut self, checker: P) -> Self
    where
        P: Fn(&GatewayError) -> bool + Send + Sync + 'static,
    {
        self.checker = Arc::new(checker);
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `f` until it succeeds, fails permanently, or retries run out
    ///
    /// # Errors
    /// Returns the last error from `f`, or `Cancelled` if `ctx` fires
    /// between attempts.
    pub async fn execute<F, Fut, T>(&self, ctx: &CancellationToken, f: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.execute_with_stats(ctx, f).await.result
    }

    /// Like [`execute`](Self::execute) but also reports attempts and delay
    pub async fn execute_with_stats<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        mut f: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            let finish = |result, attempts| RetryResult {
                result,
                attempts,
                total_delay,
            };

            if ctx.is_cancelled() {
                return finish(Err(GatewayError::Cancelled), attempt);
            }

            let error = match f().await {
                Ok(value) => return finish(Ok(value), attempt + 1),
                Err(error) => error,
            };

            if matches!(error, GatewayError::Cancelled) || !(self.checker)(&error) {
                debug!(attempt = attempt + 1, error = %error, "Error not retryable");
                return finish(Err(error), attempt + 1);
            }

            let governing = if self.config.adaptive {
                RetryConfig {
                    jitter: self.config.jitter,
                    jitter_fraction: self.config.jitter_fraction,
                    ..RetryConfig::for_category(classifier::classify(&error))
                }
            } else {
                self.config.clone()
            };

            if attempt >= governing.max_retries {
                warn!(
                    attempts = attempt + 1,
                    error = %error,
                    "Retries exhausted"
                );
                return finish(Err(error), attempt + 1);
            }

            let delay = governing.delay_for(attempt, &error);
            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                category = %classifier::classify(&error),
                "Retrying after failure"
            );

            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    return finish(Err(GatewayError::Cancelled), attempt + 1);
                }
                () = tokio::time::sleep(delay) => {}
            }

            total_delay += delay;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let policy = RetryPolicy::new(no_jitter(3));
        let result = policy
            .execute_with_stats(&CancellationToken::new(), || async { Ok(42) })
            .await;

        assert_eq!(result.result.unwrap(), 42);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(no_jitter(3));
        let calls = &AtomicU32::new(0);

        let result = policy
            .execute_with_stats(&CancellationToken::new(), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::provider("openai", "unavailable", Some(503)))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(*result.result.as_ref().unwrap(), "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retries(), 2);
        assert_eq!(result.total_delay, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_single_attempt() {
        let policy = RetryPolicy::new(no_jitter(5));
        let calls = &AtomicU32::new(0);

        let result: GatewayResult<()> = policy
            .execute(&CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::provider("openai", "bad request", Some(400)))
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Provider {
                status_code: Some(400),
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(no_jitter(2));
        let calls = &AtomicU32::new(0);

        let result = policy
            .execute_with_stats(&CancellationToken::new(), || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GatewayError::provider("openai", format!("failure {n}"), Some(500)))
            })
            .await;

        assert_eq!(result.attempts, 3);
        match result.result {
            Err(GatewayError::Provider { message, .. }) => assert_eq!(message, "failure 2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_checker() {
        let policy = RetryPolicy::new(no_jitter(3)).with_checker(|_| false);
        let calls = &AtomicU32::new(0);

        let _ = policy
            .execute(&CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GatewayError::connection("openai", "reset"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_backoff: Duration::from_secs(5),
            ..no_jitter(3)
        });
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = policy
            .execute_with_stats(&ctx, || async {
                Err::<(), _>(GatewayError::connection("openai", "reset"))
            })
            .await;

        assert!(matches!(result.result, Err(GatewayError::Cancelled)));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_stretches_delay() {
        let policy = RetryPolicy::new(no_jitter(1));
        let result = policy
            .execute_with_stats(&CancellationToken::new(), || async {
                Err::<(), _>(GatewayError::rate_limit(Some(Duration::from_secs(3)), None))
            })
            .await;

        assert_eq!(result.total_delay, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_uses_category_budget() {
        let policy = RetryPolicy::new(RetryConfig {
            adaptive: true,
            ..no_jitter(10)
        });
        let calls = &AtomicU32::new(0);

        let result = policy
            .execute_with_stats(&CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GatewayError::bulkhead_full("openai"))
            })
            .await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.total_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..no_jitter(10)
        };

        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(2), Duration::from_millis(400));
        assert_eq!(config.base_delay(3), Duration::from_millis(500));
        assert_eq!(config.base_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig {
            jitter_fraction: 0.2,
            ..RetryConfig::default()
        };
        let error = GatewayError::connection("openai", "reset");

        for _ in 0..100 {
            let delay = config.delay_for(1, &error);
            assert!(delay >= Duration::from_millis(159));
            assert!(delay <= Duration::from_millis(241));
        }
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::for_category(ErrorCategory::ClientError).max_retries, 0);
        assert_eq!(RetryConfig::for_category(ErrorCategory::RateLimit).max_retries, 5);
        assert_eq!(
            RetryConfig::for_category(ErrorCategory::Network).initial_backoff,
            Duration::from_millis(50)
        );
    }
}
