//! Progress event delivery.
//!
//! The [`EventBroadcaster`] is constructed once per process and shared by
//! reference between the coordinator and whatever transport relays events
//! to observers. Other [`EventSink`] implementations cover logging and test
//! collection.

mod broadcaster;
mod metrics;
mod sink;

pub use broadcaster::{EventBroadcaster, Subscription};
pub use metrics::DeliveryMetrics;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
