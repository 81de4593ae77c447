//! Circuit breaker state change notifications.
//!
//! Breakers publish transitions with a non-blocking send into a bounded
//! channel. A single observer task drains it, so events for one provider are
//! seen in the order they happened. When the channel is full the event is
//! dropped, logged and counted.

use crate::circuit_breaker::CircuitState;
use chrono::{DateTime, Utc};
use gateway_telemetry::ResilienceMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A circuit breaker moved from one state to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChangeEvent {
    /// Provider whose breaker changed
    pub provider: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
}

/// User callback invoked by the observer for every delivered event
pub type StateChangeCallback = Arc<dyn Fn(&StateChangeEvent) + Send + Sync>;

/// Sending half handed to circuit breakers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<StateChangeEvent>,
    dropped: Arc<AtomicU64>,
    metrics: Option<Arc<ResilienceMetrics>>,
}

impl EventPublisher {
    /// Publish without waiting; drops the event if the channel is full
    pub fn publish(&self, event: StateChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped_event();
                }
                warn!(
                    provider = %event.provider,
                    from = %event.from,
                    to = %event.to,
                    "State change channel full, event dropped"
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!(provider = %event.provider, "State change observer stopped");
            }
        }
    }

    /// Events dropped so far because the channel was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the bounded state change channel
#[must_use]
pub fn channel(
    capacity: usize,
    metrics: Option<Arc<ResilienceMetrics>>,
) -> (EventPublisher, mpsc::Receiver<StateChangeEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let publisher = EventPublisher {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
        metrics,
    };
    (publisher, rx)
}

/// Drain state change events until cancelled or every publisher is gone
pub async fn run_observer(
    mut rx: mpsc::Receiver<StateChangeEvent>,
    token: CancellationToken,
    callback: Option<StateChangeCallback>,
    metrics: Option<Arc<ResilienceMetrics>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        info!(
            provider = %event.provider,
            from = %event.from,
            to = %event.to,
            "Circuit breaker state changed"
        );

        if let Some(metrics) = &metrics {
            metrics.record_transition(&event.provider, event.from.into(), event.to.into());
        }
        if let Some(callback) = &callback {
            callback(&event);
        }
    }
    debug!("State change observer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn event(provider: &str, from: CircuitState, to: CircuitState) -> StateChangeEvent {
        StateChangeEvent {
            provider: provider.to_string(),
            from,
            to,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (publisher, _rx) = channel(1, None);

        publisher.publish(event("openai", CircuitState::Closed, CircuitState::Open));
        publisher.publish(event("openai", CircuitState::Open, CircuitState::HalfOpen));

        assert_eq!(publisher.dropped(), 1);
    }

    #[tokio::test]
    async fn test_observer_preserves_order() {
        let (publisher, rx) = channel(8, None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let callback: StateChangeCallback = Arc::new(move |event: &StateChangeEvent| {
            sink.lock().push((event.from, event.to));
        });

        publisher.publish(event("openai", CircuitState::Closed, CircuitState::Open));
        publisher.publish(event("openai", CircuitState::Open, CircuitState::HalfOpen));
        publisher.publish(event("openai", CircuitState::HalfOpen, CircuitState::Closed));
        drop(publisher);

        run_observer(rx, CancellationToken::new(), Some(callback), None).await;

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_observer_stops_on_cancel() {
        let (_publisher, rx) = channel(8, None);
        let token = CancellationToken::new();
        token.cancel();

        run_observer(rx, token, None, None).await;
    }
}
