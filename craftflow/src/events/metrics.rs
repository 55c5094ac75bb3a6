//! Delivery counters for the event broadcaster.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics for observer delivery.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Events handed to `publish`.
    published: AtomicU64,
    /// Per-observer deliveries that landed in a queue.
    delivered: AtomicU64,
    /// Per-observer deliveries dropped because the queue was full.
    dropped: AtomicU64,
    /// Observers removed because their receiver was gone.
    disconnected: AtomicU64,
    last_drop_time: RwLock<Option<Instant>>,
}

impl DeliveryMetrics {
    /// Records a publish call.
    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful delivery.
    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped delivery.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        *self.last_drop_time.write() = Some(Instant::now());
    }

    /// Records an observer removal.
    pub fn record_disconnect(&self) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of published events.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped deliveries.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of removed observers.
    #[must_use]
    pub fn disconnected(&self) -> u64 {
        self.disconnected.load(Ordering::Relaxed)
    }

    /// Returns when a delivery was last dropped.
    #[must_use]
    pub fn last_drop_time(&self) -> Option<Instant> {
        *self.last_drop_time.read()
    }

    /// Returns the drop rate as a percentage of attempted deliveries.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let delivered = self.delivered();
        let dropped = self.dropped();
        let total = delivered + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "published": self.published(),
            "delivered": self.delivered(),
            "dropped": self.dropped(),
            "disconnected": self.disconnected(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0
        })
    }
}
