//! Fallback responses for failed provider calls.
//!
//! Successful responses are cached per logical key. When the primary call
//! fails, the configured strategies are tried in order until one can serve a
//! response: a fresh cached copy, a stale copy, or a static degraded payload.

use crate::workers::BackgroundWorkers;
use gateway_config::schema::{self, FallbackStrategyKind};
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A way of producing a response without the primary call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve a cached response younger than `cache_ttl`
    Cache,
    /// Serve a cached response older than `cache_ttl` but younger than `stale_ttl`
    Stale,
    /// Serve the configured degraded payload
    Degraded,
    /// Stop and surface the primary error
    Error,
    /// Delegate to another provider; never available at this layer
    Provider,
}

impl FallbackStrategy {
    /// Stable label for logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Stale => "stale",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Provider => "provider",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FallbackStrategyKind> for FallbackStrategy {
    fn from(kind: FallbackStrategyKind) -> Self {
        match kind {
            FallbackStrategyKind::Cache => Self::Cache,
            FallbackStrategyKind::Stale => Self::Stale,
            FallbackStrategyKind::Degraded => Self::Degraded,
            FallbackStrategyKind::Error => Self::Error,
            FallbackStrategyKind::Provider => Self::Provider,
        }
    }
}

/// Fallback configuration
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Strategies tried in order after a primary failure
    pub strategies: Vec<FallbackStrategy>,
    /// Freshness window of cached responses
    pub cache_ttl: Duration,
    /// Whether stale responses may be served
    pub enable_stale: bool,
    /// How long cached responses stay usable as stale
    pub stale_ttl: Duration,
    /// Payload for the degraded strategy
    pub degraded_response: Option<Value>,
    /// Interval of the background cache sweep
    pub cleanup_interval: Duration,
    /// Maximum cached entries
    pub max_entries: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                FallbackStrategy::Cache,
                FallbackStrategy::Provider,
                FallbackStrategy::Degraded,
            ],
            cache_ttl: Duration::from_secs(5 * 60),
            enable_stale: true,
            stale_ttl: Duration::from_secs(30 * 60),
            degraded_response: None,
            cleanup_interval: Duration::from_secs(60),
            max_entries: 10_000,
        }
    }
}

impl From<&schema::FallbackConfig> for FallbackConfig {
    fn from(config: &schema::FallbackConfig) -> Self {
        Self {
            strategies: config.strategies.iter().copied().map(Into::into).collect(),
            cache_ttl: config.cache_ttl,
            enable_stale: config.enable_stale,
            stale_ttl: config.stale_ttl,
            degraded_response: config.degraded_response.clone(),
            cleanup_interval: config.cleanup_interval,
            max_entries: config.max_entries.max(1),
        }
    }
}

impl FallbackConfig {
    /// Strategy order actually tried: with stale serving on, `Stale` runs
    /// right after `Cache` unless the list already names it
    #[must_use]
    pub fn resolved_strategies(&self) -> Vec<FallbackStrategy> {
        let mut strategies = self.strategies.clone();
        if self.enable_stale && !strategies.contains(&FallbackStrategy::Stale) {
            if let Some(cache) = strategies.iter().position(|s| *s == FallbackStrategy::Cache) {
                strategies.insert(cache + 1, FallbackStrategy::Stale);
            }
        }
        strategies
    }

    /// Age after which an entry can no longer be served at all
    #[must_use]
    pub fn retention(&self) -> Duration {
        if self.enable_stale {
            self.cache_ttl.max(self.stale_ttl)
        } else {
            self.cache_ttl
        }
    }
}

/// Called with the strategy and the primary error text whenever a fallback is served
pub type FallbackCallback = Arc<dyn Fn(FallbackStrategy, &str) + Send + Sync>;

/// Fallback statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    /// Calls made through the fallback wrapper
    pub total_requests: u64,
    /// Calls answered by the primary
    pub primary_successes: u64,
    /// Calls answered by any fallback strategy
    pub fallbacks_served: u64,
    /// Fresh cache hits
    pub cache_hits: u64,
    /// Stale cache hits
    pub stale_hits: u64,
    /// Degraded payloads served
    pub degraded_hits: u64,
    /// Calls where nothing could be served
    pub failures: u64,
    /// Entries currently cached
    pub cache_entries: usize,
}

impl FallbackStats {
    /// Share of calls answered by a fallback, as a fraction in 0.0..=1.0
    #[must_use]
    pub fn fallback_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.fallbacks_served as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    stored_at: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    primary: AtomicU64,
    served: AtomicU64,
    cache: AtomicU64,
    stale: AtomicU64,
    degraded: AtomicU64,
    failures: AtomicU64,
}

enum Attempt {
    Served(Value),
    Unavailable(GatewayError),
    Surface,
}

/// Fallback handler for one provider
pub struct Fallback {
    provider: String,
    config: FallbackConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
    counters: Counters,
    on_fallback: Option<FallbackCallback>,
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("entries", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl Fallback {
    /// Create a fallback handler with an empty cache
    #[must_use]
    pub fn new(provider: impl Into<String>, mut config: FallbackConfig) -> Self {
        config.strategies = config.resolved_strategies();
        Self {
            provider: provider.into(),
            config,
            cache: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            on_fallback: None,
        }
    }

    /// Invoke `callback` whenever a fallback response is served
    #[must_use]
    pub fn with_callback(mut self, callback: FallbackCallback) -> Self {
        self.on_fallback = Some(callback);
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Start the periodic sweep of expired entries on `workers`
    ///
    /// The sweep holds a weak reference and stops once the handler is dropped.
    pub fn start_cleanup(self: &Arc<Self>, workers: &BackgroundWorkers) {
        let handler = Arc::downgrade(self);
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));

        workers.spawn("fallback-sweep", move |token| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(handler) = handler.upgrade() else { break };
                        let removed = handler.cleanup_expired();
                        if removed > 0 {
                            debug!(provider = %handler.provider, removed, "Expired fallback entries swept");
                        }
                    }
                }
            }
        });
    }

    /// Run the primary `f`, falling back when it fails
    ///
    /// # Errors
    /// - `Cancelled` if the caller cancelled; no strategy is attempted
    /// - the primary error when the `Error` strategy is reached
    /// - `AllFallbacksFailed` when no strategy could serve a response
    pub async fn execute<F, Fut>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        f: F,
    ) -> GatewayResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        match f().await {
            Ok(value) => {
                self.counters.primary.fetch_add(1, Ordering::Relaxed);
                self.store(key, value.clone());
                Ok(value)
            }
            Err(_) if ctx.is_cancelled() => Err(GatewayError::Cancelled),
            Err(GatewayError::Cancelled) => Err(GatewayError::Cancelled),
            Err(error) => self.run_strategies(key, error),
        }
    }

    fn run_strategies(&self, key: &str, original: GatewayError) -> GatewayResult<Value> {
        let mut last = None;

        for &strategy in &self.config.strategies {
            match self.attempt(strategy, key) {
                Attempt::Served(value) => {
                    self.counters.served.fetch_add(1, Ordering::Relaxed);
                    let reason = original.to_string();
                    if strategy == FallbackStrategy::Cache {
                        debug!(provider = %self.provider, key, "Serving cached fallback");
                    } else {
                        warn!(
                            provider = %self.provider,
                            key,
                            strategy = %strategy,
                            reason = %reason,
                            "Serving degraded fallback response"
                        );
                    }
                    if let Some(callback) = &self.on_fallback {
                        callback(strategy, &reason);
                    }
                    return Ok(value);
                }
                Attempt::Surface => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(provider = %self.provider, key, "Fallback chain stopped by error strategy");
                    return Err(original);
                }
                Attempt::Unavailable(error) => {
                    debug!(provider = %self.provider, key, strategy = %strategy, error = %error, "Fallback strategy unavailable");
                    last = Some(error);
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let last = last.unwrap_or_else(|| {
            GatewayError::no_fallback(&self.provider, "no fallback strategies configured")
        });
        info!(provider = %self.provider, key, "All fallback strategies failed");
        Err(GatewayError::all_fallbacks_failed(&self.provider, original, last))
    }

    fn attempt(&self, strategy: FallbackStrategy, key: &str) -> Attempt {
        match strategy {
            FallbackStrategy::Cache => match self.lookup(key) {
                Some((data, age, ttl)) if age < ttl => {
                    self.counters.cache.fetch_add(1, Ordering::Relaxed);
                    Attempt::Served(data)
                }
                _ => Attempt::Unavailable(self.unavailable("no fresh cached response")),
            },
            FallbackStrategy::Stale => {
                if !self.config.enable_stale {
                    return Attempt::Unavailable(self.unavailable("stale responses disabled"));
                }
                match self.lookup(key) {
                    Some((data, age, ttl)) if age >= ttl && age < self.config.stale_ttl => {
                        self.counters.stale.fetch_add(1, Ordering::Relaxed);
                        Attempt::Served(data)
                    }
                    _ => Attempt::Unavailable(self.unavailable("no stale cached response")),
                }
            }
            FallbackStrategy::Degraded => match &self.config.degraded_response {
                Some(payload) => {
                    self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                    Attempt::Served(payload.clone())
                }
                None => Attempt::Unavailable(self.unavailable("no degraded response configured")),
            },
            FallbackStrategy::Error => Attempt::Surface,
            FallbackStrategy::Provider => {
                Attempt::Unavailable(self.unavailable("provider fallback not available"))
            }
        }
    }

    fn unavailable(&self, reason: &str) -> GatewayError {
        GatewayError::no_fallback(&self.provider, reason)
    }

    fn lookup(&self, key: &str) -> Option<(Value, Duration, Duration)> {
        let cache = self.cache.read();
        cache
            .get(key)
            .map(|entry| (entry.data.clone(), entry.stored_at.elapsed(), entry.ttl))
    }

    fn store(&self, key: &str, data: Value) {
        let mut cache = self.cache.write();

        if !cache.contains_key(key) && cache.len() >= self.config.max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
                debug!(provider = %self.provider, evicted = %oldest, "Fallback cache full, evicted oldest entry");
            }
        }

        cache.insert(
            key.to_string(),
            CacheEntry {
                data,
                stored_at: Instant::now(),
                ttl: self.config.cache_ttl,
            },
        );
    }

    /// Fresh cached response for `key`, if any
    #[must_use]
    pub fn get_cached(&self, key: &str) -> Option<Value> {
        self.lookup(key)
            .and_then(|(data, age, ttl)| (age < ttl).then_some(data))
    }

    /// Remove entries older than the retention window, returning how many went
    pub fn cleanup_expired(&self) -> usize {
        let retention = self.config.retention();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.stored_at.elapsed() < retention);
        before - cache.len()
    }

    /// Drop every cached entry
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            primary_successes: self.counters.primary.load(Ordering::Relaxed),
            fallbacks_served: self.counters.served.load(Ordering::Relaxed),
            cache_hits: self.counters.cache.load(Ordering::Relaxed),
            stale_hits: self.counters.stale.load(Ordering::Relaxed),
            degraded_hits: self.counters.degraded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cache_entries: self.cache.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn config(strategies: Vec<FallbackStrategy>) -> FallbackConfig {
        FallbackConfig {
            strategies,
            cache_ttl: Duration::from_secs(60),
            stale_ttl: Duration::from_secs(600),
            ..FallbackConfig::default()
        }
    }

    fn failing() -> impl Future<Output = GatewayResult<Value>> {
        async { Err(GatewayError::provider("openai", "overloaded", Some(503))) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_populates_cache() {
        let fb = Fallback::new("openai", config(vec![FallbackStrategy::Cache]));
        let ctx = CancellationToken::new();

        let value = fb.execute(&ctx, "k", || async { Ok(json!({"x": 1})) }).await.unwrap();
        assert_eq!(value, json!({"x": 1}));
        assert_eq!(fb.get_cached("k"), Some(json!({"x": 1})));

        let served = fb.execute(&ctx, "k", failing).await.unwrap();
        assert_eq!(served, json!({"x": 1}));

        let stats = fb.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.fallbacks_served, 1);
        assert_eq!(stats.primary_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_window() {
        let fb = Fallback::new(
            "openai",
            config(vec![FallbackStrategy::Cache, FallbackStrategy::Stale]),
        );
        let ctx = CancellationToken::new();
        fb.execute(&ctx, "k", || async { Ok(json!("cached")) }).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let served = fb.execute(&ctx, "k", failing).await.unwrap();
        assert_eq!(served, json!("cached"));
        assert_eq!(fb.stats().stale_hits, 1);
        assert_eq!(fb.stats().cache_hits, 0);

        tokio::time::advance(Duration::from_secs(600)).await;
        let result = fb.execute(&ctx, "k", failing).await;
        assert!(matches!(result, Err(GatewayError::AllFallbacksFailed { .. })));
    }

    #[test]
    fn test_stale_follows_cache_when_enabled() {
        let base = config(vec![FallbackStrategy::Cache, FallbackStrategy::Degraded]);
        assert_eq!(
            base.resolved_strategies(),
            vec![
                FallbackStrategy::Cache,
                FallbackStrategy::Stale,
                FallbackStrategy::Degraded
            ]
        );

        let disabled = FallbackConfig {
            enable_stale: false,
            ..base.clone()
        };
        assert_eq!(disabled.resolved_strategies(), base.strategies);

        let explicit = config(vec![FallbackStrategy::Stale, FallbackStrategy::Cache]);
        assert_eq!(explicit.resolved_strategies(), explicit.strategies);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_and_callback() {
        let seen = Arc::new(Mutex::new(Vec::<FallbackStrategy>::new()));
        let sink = seen.clone();
        let fb = Fallback::new(
            "openai",
            FallbackConfig {
                degraded_response: Some(json!({"message": "try later"})),
                ..config(vec![
                    FallbackStrategy::Cache,
                    FallbackStrategy::Provider,
                    FallbackStrategy::Degraded,
                ])
            },
        )
        .with_callback(Arc::new(move |strategy: FallbackStrategy, _reason: &str| {
            sink.lock().push(strategy);
        }));

        let served = fb
            .execute(&CancellationToken::new(), "missing", failing)
            .await
            .unwrap();
        assert_eq!(served, json!({"message": "try later"}));
        assert_eq!(*seen.lock(), vec![FallbackStrategy::Degraded]);
        assert_eq!(fb.stats().degraded_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_strategy_surfaces_original() {
        let fb = Fallback::new(
            "openai",
            FallbackConfig {
                degraded_response: Some(json!("unused")),
                ..config(vec![
                    FallbackStrategy::Cache,
                    FallbackStrategy::Error,
                    FallbackStrategy::Degraded,
                ])
            },
        );

        let result = fb.execute(&CancellationToken::new(), "k", failing).await;
        assert!(matches!(
            result,
            Err(GatewayError::Provider {
                status_code: Some(503),
                ..
            })
        ));
        assert_eq!(fb.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_wraps_both_errors() {
        let fb = Fallback::new(
            "openai",
            config(vec![FallbackStrategy::Cache, FallbackStrategy::Provider]),
        );

        match fb.execute(&CancellationToken::new(), "k", failing).await {
            Err(GatewayError::AllFallbacksFailed { source, last, .. }) => {
                assert!(matches!(*source, GatewayError::Provider { .. }));
                match *last {
                    GatewayError::NoFallbackAvailable { reason, .. } => {
                        assert_eq!(reason, "provider fallback not available");
                    }
                    other => panic!("unexpected last error: {other:?}"),
                }
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_strategy_list() {
        let fb = Fallback::new("openai", config(Vec::new()));
        let result = fb.execute(&CancellationToken::new(), "k", failing).await;
        assert!(matches!(result, Err(GatewayError::AllFallbacksFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_bypasses_chain() {
        let fb = Fallback::new(
            "openai",
            FallbackConfig {
                degraded_response: Some(json!("degraded")),
                ..config(vec![FallbackStrategy::Degraded])
            },
        );
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = fb.execute(&ctx, "k", failing).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(fb.stats().degraded_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_eviction() {
        let fb = Fallback::new(
            "openai",
            FallbackConfig {
                max_entries: 2,
                ..config(vec![FallbackStrategy::Cache])
            },
        );
        let ctx = CancellationToken::new();

        fb.execute(&ctx, "a", || async { Ok(json!(1)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        fb.execute(&ctx, "b", || async { Ok(json!(2)) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        fb.execute(&ctx, "c", || async { Ok(json!(3)) }).await.unwrap();

        assert_eq!(fb.stats().cache_entries, 2);
        assert!(fb.get_cached("a").is_none());

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(fb.cleanup_expired(), 2);
        assert_eq!(fb.stats().cache_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_worker() {
        let workers = BackgroundWorkers::new();
        let fb = Arc::new(Fallback::new(
            "openai",
            FallbackConfig {
                cleanup_interval: Duration::from_secs(30),
                ..config(vec![FallbackStrategy::Cache])
            },
        ));
        fb.start_cleanup(&workers);

        fb.execute(&CancellationToken::new(), "k", || async { Ok(json!("v")) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(700)).await;

        assert_eq!(fb.stats().cache_entries, 0);
        workers.shutdown().await;
    }
}
