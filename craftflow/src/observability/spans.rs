//! Span helpers shared by the coordinator and the stage wrapper.

use std::time::Instant;
use tracing::Span;
use uuid::Uuid;

use crate::core::StageName;

/// Returns the span wrapping a whole run.
#[must_use]
pub fn run_span(run_id: Uuid) -> Span {
    tracing::info_span!("pipeline_run", %run_id)
}

/// Returns the span wrapping one stage invocation.
#[must_use]
pub fn stage_span(run_id: Uuid, stage: StageName) -> Span {
    tracing::info_span!("stage", %run_id, stage = %stage)
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(span_name = %self.name, duration_ms = elapsed, "Span finished");
        elapsed
    }
}
