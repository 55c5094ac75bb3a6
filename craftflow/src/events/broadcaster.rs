//! Per-run fan-out of progress events to observers.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{DeliveryMetrics, EventSink};
use crate::config::CraftflowConfig;
use crate::core::ProgressEvent;

type ObserverMap = DashMap<Uuid, Vec<Observer>>;

#[derive(Debug)]
struct Observer {
    id: Uuid,
    tx: mpsc::Sender<ProgressEvent>,
}

/// Registry of observers keyed by run.
///
/// Each observer owns a bounded queue. Publishing never waits: an observer
/// whose queue is full misses that event, and an observer whose receiver is
/// gone is removed. Neither affects delivery to the other observers of the
/// run. Observers only see events published after they subscribed.
#[derive(Debug)]
pub struct EventBroadcaster {
    observers: Arc<ObserverMap>,
    buffer: usize,
    metrics: Arc<DeliveryMetrics>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster {
    /// Creates a broadcaster whose observers each buffer up to `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
            metrics: Arc::new(DeliveryMetrics::default()),
        }
    }

    /// Creates a broadcaster from configuration.
    #[must_use]
    pub fn from_config(config: &CraftflowConfig) -> Self {
        Self::new(config.observer_buffer)
    }

    /// Registers a new observer for a run.
    #[must_use]
    pub fn subscribe(&self, run_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.observers
            .entry(run_id)
            .or_default()
            .push(Observer { id, tx });
        debug!(%run_id, observer_id = %id, "Observer subscribed");

        Subscription {
            id,
            run_id,
            rx,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Removes an observer. Equivalent to dropping the subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Delivers an event to every observer of its run.
    pub fn publish(&self, event: ProgressEvent) {
        self.metrics.record_publish();
        let run_id = event.run_id;

        let emptied = {
            let Some(mut observers) = self.observers.get_mut(&run_id) else {
                trace!(%run_id, event_type = %event.kind, "No observers for event");
                return;
            };
            observers.retain(|observer| match observer.tx.try_send(event.clone()) {
                Ok(()) => {
                    self.metrics.record_delivery();
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_drop();
                    warn!(
                        %run_id,
                        observer_id = %observer.id,
                        event_type = %event.kind,
                        "Observer queue full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    self.metrics.record_disconnect();
                    debug!(%run_id, observer_id = %observer.id, "Removing disconnected observer");
                    false
                }
            });
            observers.is_empty()
        };

        if emptied {
            self.observers.remove_if(&run_id, |_, observers| observers.is_empty());
        }
    }

    /// Drops every observer of a run. Their streams end once drained.
    pub fn close_run(&self, run_id: Uuid) {
        if let Some((_, observers)) = self.observers.remove(&run_id) {
            debug!(%run_id, count = observers.len(), "Closed run observers");
        }
    }

    /// Returns the number of observers subscribed to a run.
    #[must_use]
    pub fn observer_count(&self, run_id: Uuid) -> usize {
        self.observers.get(&run_id).map_or(0, |observers| observers.len())
    }

    /// Returns the number of runs with at least one observer.
    #[must_use]
    pub fn observed_runs(&self) -> usize {
        self.observers.len()
    }

    /// Returns delivery metrics.
    #[must_use]
    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }
}

#[async_trait]
impl EventSink for EventBroadcaster {
    fn try_emit(&self, event: ProgressEvent) {
        self.publish(event);
    }
}

/// An observer handle returned by [`EventBroadcaster::subscribe`].
///
/// Dropping the handle unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    run_id: Uuid,
    rx: mpsc::Receiver<ProgressEvent>,
    registry: Weak<ObserverMap>,
}

impl Subscription {
    /// Returns the observer identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the observed run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Waits for the next event. Returns `None` once the run's observers
    /// were closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new events; already queued events stay readable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Converts the handle into a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let emptied = match registry.get_mut(&self.run_id) {
            Some(mut observers) => {
                observers.retain(|observer| observer.id != self.id);
                observers.is_empty()
            }
            None => false,
        };
        if emptied {
            registry.remove_if(&self.run_id, |_, observers| observers.is_empty());
        }
    }
}
