//! Prometheus metrics for the resilience engine.
//!
//! Provides metrics for:
//! - Protected call outcomes and latencies per provider
//! - Circuit breaker state and transitions
//! - Bulkhead occupancy and rejections
//! - Retries and served fallbacks

use gateway_config::schema::MetricsConfig;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::{error, info};

const NAMESPACE: &str = "resilience";

/// Resilience metrics registry and collectors
pub struct ResilienceMetrics {
    registry: Registry,
    calls_total: CounterVec,
    call_latency: HistogramVec,
    circuit_state: GaugeVec,
    circuit_transitions: CounterVec,
    rejections_total: CounterVec,
    bulkhead_active: GaugeVec,
    bulkhead_queued: GaugeVec,
    retry_attempts: CounterVec,
    fallbacks_total: CounterVec,
    dropped_events: IntCounter,
}

impl ResilienceMetrics {
    /// Create a new metrics instance with its own registry
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calls_total = CounterVec::new(
            Opts::new("calls_total", "Protected provider calls by outcome").namespace(NAMESPACE),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_latency = HistogramVec::new(
            HistogramOpts::new(
                "call_duration_seconds",
                "Latency of protected provider calls in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(config.latency_buckets.clone()),
            &["provider"],
        )?;
        registry.register(Box::new(call_latency.clone()))?;

        let circuit_state = GaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;
        registry.register(Box::new(circuit_state.clone()))?;

        let circuit_transitions = CounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            )
            .namespace(NAMESPACE),
            &["provider", "from", "to"],
        )?;
        registry.register(Box::new(circuit_transitions.clone()))?;

        let rejections_total = CounterVec::new(
            Opts::new("rejections_total", "Calls rejected by a resilience pattern")
                .namespace(NAMESPACE),
            &["provider", "reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let bulkhead_active = GaugeVec::new(
            Opts::new("bulkhead_active", "Calls holding a bulkhead permit").namespace(NAMESPACE),
            &["provider"],
        )?;
        registry.register(Box::new(bulkhead_active.clone()))?;

        let bulkhead_queued = GaugeVec::new(
            Opts::new("bulkhead_queued", "Calls waiting in the bulkhead queue")
                .namespace(NAMESPACE),
            &["provider"],
        )?;
        registry.register(Box::new(bulkhead_queued.clone()))?;

        let retry_attempts = CounterVec::new(
            Opts::new("retry_attempts_total", "Retries performed after a failed attempt")
                .namespace(NAMESPACE),
            &["provider"],
        )?;
        registry.register(Box::new(retry_attempts.clone()))?;

        let fallbacks_total = CounterVec::new(
            Opts::new("fallbacks_total", "Fallback responses served by strategy")
                .namespace(NAMESPACE),
            &["provider", "strategy"],
        )?;
        registry.register(Box::new(fallbacks_total.clone()))?;

        let dropped_events = IntCounter::with_opts(
            Opts::new(
                "state_events_dropped_total",
                "Circuit state change events dropped on a full channel",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(dropped_events.clone()))?;

        info!("Resilience metrics initialized");

        Ok(Self {
            registry,
            calls_total,
            call_latency,
            circuit_state,
            circuit_transitions,
            rejections_total,
            bulkhead_active,
            bulkhead_queued,
            retry_attempts,
            fallbacks_total,
            dropped_events,
        })
    }

    /// Record a finished protected call
    pub fn record_call(&self, provider: &str, outcome: &str, latency: Duration) {
        self.calls_total
            .with_label_values(&[provider, outcome])
            .inc();
        self.call_latency
            .with_label_values(&[provider])
            .observe(latency.as_secs_f64());
    }

    /// Record a rejection by one of the patterns
    pub fn record_rejection(&self, provider: &str, reason: &str) {
        self.rejections_total
            .with_label_values(&[provider, reason])
            .inc();
    }

    /// Update circuit breaker state
    pub fn update_circuit_breaker(&self, provider: &str, state: CircuitBreakerState) {
        self.circuit_state
            .with_label_values(&[provider])
            .set(state.gauge_value());
    }

    /// Record a circuit transition and update the state gauge
    pub fn record_transition(
        &self,
        provider: &str,
        from: CircuitBreakerState,
        to: CircuitBreakerState,
    ) {
        self.circuit_transitions
            .with_label_values(&[provider, from.as_str(), to.as_str()])
            .inc();
        self.update_circuit_breaker(provider, to);
    }

    /// Update bulkhead occupancy
    pub fn update_bulkhead(&self, provider: &str, active: usize, queued: usize) {
        self.bulkhead_active
            .with_label_values(&[provider])
            .set(active as f64);
        self.bulkhead_queued
            .with_label_values(&[provider])
            .set(queued as f64);
    }

    /// Record retries performed by one call
    pub fn record_retries(&self, provider: &str, retries: u32) {
        if retries > 0 {
            self.retry_attempts
                .with_label_values(&[provider])
                .inc_by(f64::from(retries));
        }
    }

    /// Record a served fallback
    pub fn record_fallback(&self, provider: &str, strategy: &str) {
        self.fallbacks_total
            .with_label_values(&[provider, strategy])
            .inc();
    }

    /// Record a dropped state change event
    pub fn record_dropped_event(&self) {
        self.dropped_events.inc();
    }

    /// Get metrics as Prometheus text format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}

/// Circuit breaker state for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed (normal operation)
    Closed,
    /// Circuit is open (failing fast)
    Open,
    /// Circuit is half-open (testing)
    HalfOpen,
}

impl CircuitBreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }

    /// Label value used in transition metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}
