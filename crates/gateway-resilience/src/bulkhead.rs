//! Bulkhead pattern for per-provider concurrency isolation.
//!
//! A semaphore bounds concurrent calls. Callers that find no free permit join
//! a bounded FIFO queue served by a background dispatcher, which hands each
//! freed permit to the oldest waiter that is still waiting.

use crate::workers::BackgroundWorkers;
use gateway_config::schema;
use gateway_core::{GatewayError, GatewayResult};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bulkhead configuration
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum concurrent calls
    pub max_concurrent: usize,
    /// Maximum callers waiting for a permit
    pub max_queue: usize,
    /// Longest a caller waits in the queue
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 20,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&schema::BulkheadConfig> for BulkheadConfig {
    fn from(config: &schema::BulkheadConfig) -> Self {
        Self {
            max_concurrent: (config.max_concurrent as usize).max(1),
            max_queue: config.max_queue as usize,
            queue_timeout: config.queue_timeout,
        }
    }
}

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    /// Configured concurrency limit
    pub max_concurrent: usize,
    /// Calls currently holding a permit
    pub active: usize,
    /// Permits currently free
    pub available: usize,
    /// Callers currently waiting
    pub queued: usize,
    /// Configured queue bound
    pub max_queue: usize,
    /// Calls that obtained a permit
    pub total_admitted: u64,
    /// Calls that had to wait in the queue
    pub total_queued: u64,
    /// Calls rejected because the queue was full
    pub total_rejected: u64,
    /// Queued calls that gave up after `queue_timeout`
    pub total_timeouts: u64,
    /// Calls abandoned by their caller
    pub total_cancelled: u64,
}

#[derive(Debug)]
struct QueuedRequest {
    grant: oneshot::Sender<OwnedSemaphorePermit>,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

/// Concurrency limiter for one provider
#[derive(Debug)]
pub struct Bulkhead {
    provider: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<QueuedRequest>,
    waiting: AtomicUsize,
    counters: Counters,
}

impl Bulkhead {
    /// Create a bulkhead and start its dispatcher on `workers`
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        config: BulkheadConfig,
        workers: &BackgroundWorkers,
    ) -> Self {
        let provider = provider.into();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let (queue, rx) = mpsc::unbounded_channel();

        let dispatcher_provider = provider.clone();
        let dispatcher_semaphore = semaphore.clone();
        workers.spawn("bulkhead-dispatcher", move |token| {
            dispatch(dispatcher_provider, dispatcher_semaphore, rx, token)
        });

        Self {
            provider,
            config,
            semaphore,
            queue,
            waiting: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Run `f` under a permit, queueing if none is free
    ///
    /// # Errors
    /// - `BulkheadFull` if no permit is free and the queue is full
    /// - `BulkheadTimeout` if the queue wait exceeds `queue_timeout`
    /// - `Cancelled` if `ctx` is cancelled while waiting or running
    /// - whatever `f` returns otherwise
    pub async fn execute<F, Fut, T>(&self, ctx: &CancellationToken, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        if ctx.is_cancelled() {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Cancelled);
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => self.wait_for_permit(ctx).await?,
            Err(TryAcquireError::Closed) => {
                return Err(GatewayError::internal("bulkhead semaphore closed"));
            }
        };
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);

        let result = tokio::select! {
            biased;
            () = ctx.cancelled() => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Cancelled)
            }
            result = f() => result,
        };

        drop(permit);
        result
    }

    async fn wait_for_permit(&self, ctx: &CancellationToken) -> GatewayResult<OwnedSemaphorePermit> {
        let Some(_slot) = QueueSlot::reserve(&self.waiting, self.config.max_queue) else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider = %self.provider,
                max_concurrent = self.config.max_concurrent,
                max_queue = self.config.max_queue,
                "Bulkhead full, request rejected"
            );
            return Err(GatewayError::bulkhead_full(&self.provider));
        };

        let (grant, granted) = oneshot::channel();
        let enqueued_at = Instant::now();
        self.queue
            .send(QueuedRequest { grant, enqueued_at })
            .map_err(|_| GatewayError::internal("bulkhead dispatcher stopped"))?;
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!(provider = %self.provider, "Request queued for bulkhead permit");

        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Cancelled)
            }
            permit = granted => {
                permit.map_err(|_| GatewayError::internal("bulkhead dispatcher stopped"))
            }
            () = tokio::time::sleep(self.config.queue_timeout) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let waited = enqueued_at.elapsed();
                warn!(
                    provider = %self.provider,
                    waited_ms = waited.as_millis() as u64,
                    "Bulkhead queue wait timed out"
                );
                Err(GatewayError::bulkhead_timeout(&self.provider, waited))
            }
        }
    }

    /// True when every permit is taken and the queue is at capacity
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
            && self.waiting.load(Ordering::Acquire) >= self.config.max_queue
    }

    /// Permits currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Snapshot of occupancy and counters
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        let available = self.semaphore.available_permits();
        BulkheadStats {
            max_concurrent: self.config.max_concurrent,
            active: self.config.max_concurrent.saturating_sub(available),
            available,
            queued: self.waiting.load(Ordering::Acquire),
            max_queue: self.config.max_queue,
            total_admitted: self.counters.admitted.load(Ordering::Relaxed),
            total_queued: self.counters.queued.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            total_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            total_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// A reserved place in the wait queue, released on drop
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn reserve(waiting: &'a AtomicUsize, max_queue: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_queue).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { waiting })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn dispatch(
    provider: String,
    semaphore: Arc<Semaphore>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            () = token.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.grant.is_closed() {
            continue;
        }

        let permit = tokio::select! {
            biased;
            () = token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // A waiter that gave up meanwhile returns the permit to the pool
        if request.grant.send(permit).is_err() {
            debug!(provider = %provider, "Queued request gave up before dispatch");
        } else {
            debug!(
                provider = %provider,
                waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                "Bulkhead permit dispatched"
            );
        }
    }
    debug!(provider = %provider, "Bulkhead dispatcher stopped");
}
