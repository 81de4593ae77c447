//! Per-provider composition of the resilience patterns.
//!
//! The manager lazily creates one set of patterns per provider and wraps each
//! call, outermost first, in the circuit breaker, the bulkhead, the retry
//! policy and the per-attempt timeout. The fallback entry point hands that
//! whole chain to the provider's fallback handler as its primary.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::events::{self, EventPublisher, StateChangeCallback};
use crate::fallback::{
    Fallback, FallbackCallback, FallbackConfig, FallbackStats, FallbackStrategy,
};
use crate::registry::KeyedRegistry;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::timeout::{TimeoutConfig, TimeoutManager};
use crate::workers::BackgroundWorkers;
use chrono::{DateTime, Utc};
use gateway_config::GatewayConfig;
use gateway_core::{GatewayError, GatewayResult, HealthStatus};
use gateway_telemetry::{provider_span, ResilienceMetrics};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Share of fallback-served requests above which health reports a warning
const FALLBACK_WARNING_RATE: f64 = 0.5;

/// Called with the provider id, the strategy and the primary error text
/// whenever a fallback response is served
pub type ProviderFallbackCallback = Arc<dyn Fn(&str, FallbackStrategy, &str) + Send + Sync>;

/// Pattern instances guarding one provider; `None` when disabled
#[derive(Debug)]
struct ProviderPatterns {
    breaker: Option<CircuitBreaker>,
    bulkhead: Option<Bulkhead>,
    retry: Option<RetryPolicy>,
    fallback: Option<Arc<Fallback>>,
    timeouts: TimeoutManager,
}

/// Statistics for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    /// Circuit breaker counters, if enabled
    pub circuit_breaker: Option<CircuitBreakerStats>,
    /// Bulkhead occupancy, if enabled
    pub bulkhead: Option<BulkheadStats>,
    /// Fallback counters, if enabled
    pub fallback: Option<FallbackStats>,
}

/// Statistics for every provider seen so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResilienceStats {
    /// Per-provider statistics, ordered by provider id
    pub providers: BTreeMap<String, ProviderStats>,
    /// State change events dropped because the observer fell behind
    pub dropped_state_events: u64,
}

/// Health of one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    /// Verdict
    pub status: HealthStatus,
    /// Circuit state, if the breaker is enabled
    pub circuit_state: Option<CircuitState>,
    /// Conditions that lowered the verdict
    pub issues: Vec<String>,
    /// Conditions worth attention that did not lower the verdict
    pub warnings: Vec<String>,
}

/// Health of every provider seen so far
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Worst provider verdict, `Healthy` when no provider has been used
    pub status: HealthStatus,
    /// Per-provider health, ordered by provider id
    pub providers: BTreeMap<String, ProviderHealth>,
    /// When the report was taken
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// True when no provider is unhealthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.status.is_problematic()
    }
}

/// Resilience manager shared by all provider calls
pub struct ResilienceManager {
    config: GatewayConfig,
    providers: KeyedRegistry<ProviderPatterns>,
    workers: BackgroundWorkers,
    events: OnceLock<EventPublisher>,
    metrics: Option<Arc<ResilienceMetrics>>,
    on_state_change: Option<StateChangeCallback>,
    on_fallback: Option<ProviderFallbackCallback>,
}

impl fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("providers", &self.providers.len())
            .field("workers", &self.workers.running())
            .field("closed", &self.workers.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl ResilienceManager {
    /// Create a manager; patterns are created on first use of each provider
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            providers: KeyedRegistry::new(),
            workers: BackgroundWorkers::new(),
            events: OnceLock::new(),
            metrics: None,
            on_state_change: None,
            on_fallback: None,
        }
    }

    /// Record calls, rejections and transitions into `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Invoke `callback` for every circuit state change
    #[must_use]
    pub fn on_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Invoke `callback` for every fallback response served
    #[must_use]
    pub fn on_fallback(mut self, callback: ProviderFallbackCallback) -> Self {
        self.on_fallback = Some(callback);
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run `f` for `provider` through the enabled patterns
    ///
    /// # Errors
    /// Returns pattern rejections (`CircuitBreakerOpen`, `TooManyRequests`,
    /// `BulkheadFull`, `BulkheadTimeout`), `Timeout`, `Cancelled`, or the
    /// last error from `f`. Fails with `Configuration` once closed.
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        f: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.ensure_open()?;
        let patterns = self.patterns(provider);

        self.run_protected(ctx, provider, &patterns, f)
            .instrument(provider_span(provider, "execute"))
            .await
    }

    /// Like [`execute`](Self::execute), falling back to cached or degraded
    /// responses stored under `key` when the chain fails
    ///
    /// # Errors
    /// Returns `AllFallbacksFailed` when no strategy could serve, the primary
    /// error when the `Error` strategy is reached, or `Cancelled`. Without a
    /// fallback handler the errors of [`execute`](Self::execute) pass through.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        key: &str,
        f: F,
    ) -> GatewayResult<Value>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        self.ensure_open()?;
        let patterns = self.patterns(provider);

        let call = async {
            match &patterns.fallback {
                Some(fallback) => {
                    fallback
                        .execute(ctx, key, || self.run_protected(ctx, provider, &patterns, f))
                        .await
                }
                None => self.run_protected(ctx, provider, &patterns, f).await,
            }
        };
        call.instrument(provider_span(provider, "execute_with_fallback"))
            .await
    }

    /// False when the provider's circuit is open and not yet due for a
    /// probe, or its bulkhead has no permit and no queue space left
    #[must_use]
    pub fn is_provider_available(&self, provider: &str) -> bool {
        if self.workers.is_shutdown() {
            return false;
        }
        self.providers.get(provider).map_or(true, |patterns| {
            patterns
                .breaker
                .as_ref()
                .map_or(true, CircuitBreaker::is_available)
                && patterns.bulkhead.as_ref().map_or(true, |b| !b.is_full())
        })
    }

    /// Statistics for every provider used so far
    #[must_use]
    pub fn stats(&self) -> ResilienceStats {
        let providers = self
            .providers
            .snapshot()
            .into_iter()
            .map(|(id, patterns)| {
                let stats = ProviderStats {
                    circuit_breaker: patterns.breaker.as_ref().map(CircuitBreaker::stats),
                    bulkhead: patterns.bulkhead.as_ref().map(Bulkhead::stats),
                    fallback: patterns.fallback.as_ref().map(|f| f.stats()),
                };
                (id, stats)
            })
            .collect();

        ResilienceStats {
            providers,
            dropped_state_events: self.events.get().map_or(0, EventPublisher::dropped),
        }
    }

    /// Health of every provider used so far
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let mut overall = HealthStatus::Healthy;
        let mut providers = BTreeMap::new();

        for (id, patterns) in self.providers.snapshot() {
            let health = provider_health(&patterns);
            if health.status != HealthStatus::Healthy || !health.warnings.is_empty() {
                warn!(
                    provider = %id,
                    status = %health.status,
                    issues = ?health.issues,
                    warnings = ?health.warnings,
                    "Provider health degraded"
                );
            }
            overall = overall.worst(health.status);
            providers.insert(id, health);
        }

        HealthReport {
            status: overall,
            providers,
            checked_at: Utc::now(),
        }
    }

    /// Force the provider's circuit closed; false if it has no breaker
    pub fn reset_provider(&self, provider: &str) -> bool {
        match self.providers.get(provider) {
            Some(patterns) => match &patterns.breaker {
                Some(breaker) => {
                    breaker.reset();
                    self.record_circuit_state(provider, breaker);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Force every circuit closed
    pub fn reset_all(&self) {
        for (id, patterns) in self.providers.snapshot() {
            if let Some(breaker) = &patterns.breaker {
                breaker.reset();
                self.record_circuit_state(&id, breaker);
            }
        }
        info!("All circuit breakers reset");
    }

    /// Stop and join every background worker; later calls fail
    pub async fn close(&self) {
        if self.workers.is_shutdown() {
            return;
        }
        self.workers.shutdown().await;
        info!(providers = self.providers.len(), "Resilience manager closed");
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.workers.is_shutdown()
    }

    fn ensure_open(&self) -> GatewayResult<()> {
        if self.workers.is_shutdown() {
            return Err(GatewayError::configuration("resilience manager is closed"));
        }
        Ok(())
    }

    fn patterns(&self, provider: &str) -> Arc<ProviderPatterns> {
        self.providers
            .get_or_create(provider, || self.build_patterns(provider))
    }

    fn build_patterns(&self, provider: &str) -> ProviderPatterns {
        let settings = self.config.resilience_for(provider);

        let breaker = settings.circuit_breaker.enabled.then(|| {
            CircuitBreaker::new(provider, CircuitBreakerConfig::from(&settings.circuit_breaker))
                .with_events(self.publisher())
        });
        let bulkhead = settings.bulkhead.enabled.then(|| {
            Bulkhead::new(provider, BulkheadConfig::from(&settings.bulkhead), &self.workers)
        });
        let retry = settings
            .retry
            .enabled
            .then(|| RetryPolicy::new(RetryConfig::from(&settings.retry)));
        let fallback = settings.fallback.enabled.then(|| {
            let fallback = Arc::new(
                Fallback::new(provider, FallbackConfig::from(&settings.fallback))
                    .with_callback(self.fallback_callback(provider)),
            );
            fallback.start_cleanup(&self.workers);
            fallback
        });

        info!(
            provider = %provider,
            circuit_breaker = breaker.is_some(),
            bulkhead = bulkhead.is_some(),
            retry = retry.is_some(),
            fallback = fallback.is_some(),
            "Resilience patterns created"
        );

        ProviderPatterns {
            breaker,
            bulkhead,
            retry,
            fallback,
            timeouts: TimeoutManager::new(TimeoutConfig::from(&settings.timeout)),
        }
    }

    /// Publisher shared by every breaker; starts the observer on first use
    fn publisher(&self) -> EventPublisher {
        self.events
            .get_or_init(|| {
                let capacity = self.config.resilience.events.channel_capacity;
                let (publisher, rx) = events::channel(capacity, self.metrics.clone());
                let callback = self.on_state_change.clone();
                let metrics = self.metrics.clone();
                self.workers.spawn("state-observer", move |token| {
                    events::run_observer(rx, token, callback, metrics)
                });
                publisher
            })
            .clone()
    }

    fn fallback_callback(&self, provider: &str) -> FallbackCallback {
        let provider = provider.to_string();
        let metrics = self.metrics.clone();
        let user = self.on_fallback.clone();

        Arc::new(move |strategy: FallbackStrategy, reason: &str| {
            if let Some(metrics) = &metrics {
                metrics.record_fallback(&provider, strategy.as_str());
            }
            if let Some(user) = &user {
                user(&provider, strategy, reason);
            }
        })
    }

    async fn run_protected<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        patterns: &ProviderPatterns,
        f: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let started = Instant::now();
        let result = patterns
            .timeouts
            .overall(self.run_breaker(ctx, provider, patterns, f))
            .await;
        self.record_call(provider, patterns, result.as_ref().err(), started.elapsed());
        result
    }

    async fn run_breaker<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        patterns: &ProviderPatterns,
        f: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        match &patterns.breaker {
            Some(breaker) => {
                breaker
                    .execute(|| self.run_bulkhead(ctx, provider, patterns, f))
                    .await
            }
            None => self.run_bulkhead(ctx, provider, patterns, f).await,
        }
    }

    async fn run_bulkhead<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        patterns: &ProviderPatterns,
        f: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        match &patterns.bulkhead {
            Some(bulkhead) => {
                bulkhead
                    .execute(ctx, || self.run_retry(ctx, provider, patterns, f))
                    .await
            }
            None => self.run_retry(ctx, provider, patterns, f).await,
        }
    }

    async fn run_retry<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        patterns: &ProviderPatterns,
        mut f: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let timeouts = &patterns.timeouts;
        let mut attempt = move || timeouts.attempt(f());

        match &patterns.retry {
            Some(policy) => {
                let outcome = policy.execute_with_stats(ctx, attempt).await;
                if let Some(metrics) = &self.metrics {
                    metrics.record_retries(provider, outcome.retries());
                }
                if outcome.retries() > 0 {
                    debug!(
                        provider = %provider,
                        attempts = outcome.attempts,
                        delay_ms = outcome.total_delay.as_millis() as u64,
                        "Call retried"
                    );
                }
                outcome.result
            }
            None => attempt().await,
        }
    }

    fn record_call(
        &self,
        provider: &str,
        patterns: &ProviderPatterns,
        error: Option<&GatewayError>,
        latency: Duration,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        let outcome = error.map_or("success", GatewayError::error_code);
        metrics.record_call(provider, outcome, latency);

        if let Some(error) = error {
            if matches!(
                error,
                GatewayError::CircuitBreakerOpen { .. }
                    | GatewayError::TooManyRequests { .. }
                    | GatewayError::BulkheadFull { .. }
                    | GatewayError::BulkheadTimeout { .. }
            ) {
                metrics.record_rejection(provider, error.error_code());
            }
        }

        if let Some(breaker) = &patterns.breaker {
            metrics.update_circuit_breaker(provider, breaker.state().into());
        }
        if let Some(bulkhead) = &patterns.bulkhead {
            let stats = bulkhead.stats();
            metrics.update_bulkhead(provider, stats.active, stats.queued);
        }
    }

    fn record_circuit_state(&self, provider: &str, breaker: &CircuitBreaker) {
        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker(provider, breaker.state().into());
        }
    }
}

fn provider_health(patterns: &ProviderPatterns) -> ProviderHealth {
    let mut health = ProviderHealth {
        status: HealthStatus::Healthy,
        circuit_state: None,
        issues: Vec::new(),
        warnings: Vec::new(),
    };

    if let Some(breaker) = &patterns.breaker {
        let state = breaker.state();
        health.circuit_state = Some(state);
        if state == CircuitState::Open {
            health.status = HealthStatus::Unhealthy;
            health.issues.push("circuit breaker open".to_string());
        }
    }

    if let Some(bulkhead) = &patterns.bulkhead {
        let stats = bulkhead.stats();
        if stats.available == 0 {
            health.status = health.status.worst(HealthStatus::Degraded);
            health.issues.push(format!(
                "bulkhead at capacity ({} active, {} queued)",
                stats.active, stats.queued
            ));
        }
    }

    if let Some(fallback) = &patterns.fallback {
        let rate = fallback.stats().fallback_rate();
        if rate > FALLBACK_WARNING_RATE {
            health
                .warnings
                .push(format!("high fallback usage: {:.0}% of requests", rate * 100.0));
        }
    }

    health
}
