//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};
use uuid::Uuid;

use crate::core::{EventKind, ProgressEvent, RunStatus};

/// Receives progress events from the coordinator and the stage wrapper.
///
/// Emission is best-effort: a sink must never block the pipeline and must
/// never fail it.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: ProgressEvent) {
        self.try_emit(event);
    }

    /// Emits an event without blocking.
    ///
    /// Errors are logged and suppressed.
    fn try_emit(&self, event: ProgressEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: ProgressEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &ProgressEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.kind,
                run_id = %event.run_id,
                event_data = %event.data,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = %event.kind,
                run_id = %event.run_id,
                event_data = %event.data,
                "Event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: ProgressEvent) {
        self.log_event(&event);
    }
}

/// A collecting event sink for testing and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the events of one kind, in emission order.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the events of one run, in emission order.
    #[must_use]
    pub fn events_for_run(&self, run_id: Uuid) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Returns the run statuses announced for a run, in emission order.
    #[must_use]
    pub fn statuses(&self, run_id: Uuid) -> Vec<RunStatus> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .filter_map(ProgressEvent::status)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageName;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(ProgressEvent::error(Uuid::new_v4(), "ignored")).await;
        sink.try_emit(ProgressEvent::error(Uuid::new_v4(), "ignored"));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::default();
        sink.emit(ProgressEvent::run_status_changed(Uuid::new_v4(), RunStatus::Building))
            .await;
        LoggingEventSink::debug().try_emit(ProgressEvent::error(Uuid::new_v4(), "boom"));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        let run_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        sink.emit(ProgressEvent::run_status_changed(run_id, RunStatus::Analyzing)).await;
        sink.try_emit(ProgressEvent::stage_started(run_id, StageName::RequirementInterpreter, Uuid::new_v4()));
        sink.try_emit(ProgressEvent::run_status_changed(other, RunStatus::Failed));
        sink.try_emit(ProgressEvent::run_status_changed(run_id, RunStatus::Designing));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.events_of_kind(EventKind::StageStarted).len(), 1);
        assert_eq!(sink.events_for_run(other).len(), 1);
        assert_eq!(sink.statuses(run_id), vec![RunStatus::Analyzing, RunStatus::Designing]);

        sink.clear();
        assert!(sink.is_empty());
    }
}
