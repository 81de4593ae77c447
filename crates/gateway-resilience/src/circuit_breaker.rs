//! Circuit breaker pattern implementation.
//!
//! One breaker guards one provider. Admission and outcome recording each take
//! the breaker lock briefly; the protected call runs with no lock held.

use crate::events::{EventPublisher, StateChangeEvent};
use chrono::Utc;
use gateway_config::schema;
use gateway_core::{GatewayError, GatewayResult};
use gateway_telemetry::CircuitBreakerState;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the retry time passes
    Open,
    /// A limited number of probe requests are admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

impl From<CircuitState> for CircuitBreakerState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open => Self::Open,
            CircuitState::HalfOpen => Self::HalfOpen,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
        }
    }
}

impl From<&schema::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(config: &schema::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            timeout: config.timeout,
            half_open_max_requests: config.half_open_max_requests.max(1),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success or transition
    pub consecutive_failures: u32,
    /// Successes since the last failure or transition
    pub consecutive_successes: u32,
    /// Probes currently in flight while half-open
    pub half_open_in_flight: u32,
    /// Calls that reached the breaker
    pub total_requests: u64,
    /// Calls that failed
    pub total_failures: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls rejected without running
    pub total_rejected: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_retry_at: Option<Instant>,
    half_open_in_flight: u32,
    // Bumped on every transition so late outcomes from an earlier state are
    // only counted, never acted on.
    generation: u64,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_retry_at: None,
            half_open_in_flight: 0,
            generation: 0,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejected: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Circuit breaker for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    events: Option<EventPublisher>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    #[must_use]
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            events: None,
        }
    }

    /// Publish state transitions to the given channel
    #[must_use]
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Provider this breaker guards
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` if the circuit admits it, then record the outcome
    ///
    /// A `Cancelled` outcome frees any half-open slot but counts as neither
    /// success nor failure.
    ///
    /// # Errors
    /// Returns `CircuitBreakerOpen` or `TooManyRequests` when rejected,
    /// otherwise whatever `f` returns.
    pub async fn execute<F, Fut, T>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut admission = self.admit()?;
        let result = f().await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(GatewayError::Cancelled) => Outcome::Ignored,
            Err(_) => Outcome::Failure,
        };
        admission.finish(outcome);

        result
    }

    /// Current state, without triggering any transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// False only while open and not yet due for a probe
    #[must_use]
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .next_retry_at
                .map_or(true, |at| Instant::now() > at),
            CircuitState::Closed | CircuitState::HalfOpen => true,
        }
    }

    /// Snapshot of counters and state
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejected: inner.total_rejected,
        }
    }

    /// Force the circuit closed and zero every counter
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        let generation = inner.generation;
        *inner = BreakerState::new();
        inner.generation = generation;
        info!(provider = %self.provider, "Circuit breaker reset");
    }

    fn admit(&self) -> GatewayResult<Admission<'_>> {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(self.admission(&inner, false)),
            CircuitState::Open => {
                let due = inner
                    .next_retry_at
                    .map_or(true, |at| Instant::now() > at);
                if due {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(self.admission(&inner, true))
                } else {
                    inner.total_rejected += 1;
                    debug!(provider = %self.provider, "Circuit open, request rejected");
                    Err(GatewayError::circuit_breaker_open(&self.provider))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    Ok(self.admission(&inner, true))
                } else {
                    inner.total_rejected += 1;
                    debug!(
                        provider = %self.provider,
                        in_flight = inner.half_open_in_flight,
                        "Half-open probe budget exhausted, request rejected"
                    );
                    Err(GatewayError::too_many_requests(&self.provider))
                }
            }
        }
    }

    fn admission(&self, inner: &BreakerState, half_open: bool) -> Admission<'_> {
        Admission {
            breaker: self,
            generation: inner.generation,
            half_open,
            finished: false,
        }
    }

    fn record(&self, generation: u64, half_open: bool, outcome: Outcome) {
        let mut inner = self.inner.lock();
        let current = inner.generation == generation;

        if half_open && current {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match outcome {
            Outcome::Ignored => {}
            Outcome::Success => {
                inner.total_successes += 1;
                if !current {
                    return;
                }
                inner.consecutive_successes += 1;
                inner.consecutive_failures = 0;
                if inner.state == CircuitState::HalfOpen
                    && inner.consecutive_successes >= self.config.success_threshold
                {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            Outcome::Failure => {
                inner.total_failures += 1;
                if !current {
                    return;
                }
                inner.consecutive_failures += 1;
                inner.consecutive_successes = 0;
                let state = inner.state;
                match state {
                    CircuitState::Closed
                        if inner.consecutive_failures >= self.config.failure_threshold =>
                    {
                        self.transition(&mut inner, CircuitState::Open);
                    }
                    CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
                    _ => {}
                }
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.next_retry_at = match to {
            CircuitState::Open => Some(Instant::now() + self.config.timeout),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        };

        if to == CircuitState::Open {
            warn!(
                provider = %self.provider,
                from = %from,
                retry_in_ms = self.config.timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        } else {
            info!(provider = %self.provider, from = %from, to = %to, "Circuit breaker transition");
        }

        if let Some(events) = &self.events {
            events.publish(StateChangeEvent {
                provider: self.provider.clone(),
                from,
                to,
                at: Utc::now(),
            });
        }
    }
}

/// Ticket for one admitted call; frees a half-open slot even if the call is dropped
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    finished: bool,
}

impl Admission<'_> {
    fn finish(&mut self, outcome: Outcome) {
        self.finished = true;
        self.breaker.record(self.generation, self.half_open, outcome);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker
                .record(self.generation, self.half_open, Outcome::Ignored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Err(GatewayError::provider("openai", "boom", Some(500))) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("openai", config());

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let mut called = false;
        let result = cb
            .execute(|| {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitBreakerOpen { .. })));
        assert!(!called);
        assert!(!cb.is_available());
        assert_eq!(cb.stats().total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new("openai", config());

        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = CircuitBreaker::new("openai", config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.is_available());

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("openai", config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_probes() {
        let cb = CircuitBreaker::new("openai", config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.execute(|| async move {
            let _ = release_rx.await;
            Ok(())
        });
        tokio::pin!(probe);

        // Drive the probe until it parks on the channel
        assert!(futures_poll_once(probe.as_mut()).await.is_none());

        let second = succeed(&cb).await;
        assert!(matches!(second, Err(GatewayError::TooManyRequests { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap();
        assert_eq!(cb.stats().half_open_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_outcome_not_counted() {
        let cb = CircuitBreaker::new("openai", config());

        let _ = fail(&cb).await;
        let result: GatewayResult<()> = cb.execute(|| async { Err(GatewayError::Cancelled) }).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));

        let stats = cb.stats();
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = CircuitBreaker::new("openai", config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        {
            let probe = cb.execute(|| std::future::pending::<GatewayResult<()>>());
            tokio::pin!(probe);
            assert!(futures_poll_once(probe.as_mut()).await.is_none());
        }

        assert_eq!(cb.stats().half_open_in_flight, 0);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_and_zeroes() {
        let cb = CircuitBreaker::new("openai", config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.total_requests, 0);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_published() {
        let (publisher, mut rx) = events::channel(8, None);
        let cb = CircuitBreaker::new("anthropic", config()).with_events(publisher);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        succeed(&cb).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.provider, "anthropic");
        assert_eq!((first.from, first.to), (CircuitState::Closed, CircuitState::Open));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.from, second.to), (CircuitState::Open, CircuitState::HalfOpen));
    }

    /// Polls a future once, returning its output if it completed
    async fn futures_poll_once<F: Future + Unpin>(mut fut: F) -> Option<F::Output> {
        std::future::poll_fn(|cx| {
            std::task::Poll::Ready(match std::pin::Pin::new(&mut fut).poll(cx) {
                std::task::Poll::Ready(out) => Some(out),
                std::task::Poll::Pending => None,
            })
        })
        .await
    }
}
