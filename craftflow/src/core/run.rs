//! Pipeline runs and stage execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutionStatus, RunStatus, StageName};
use crate::errors::ErrorCategory;

/// One end-to-end execution of the generation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identifier.
    pub id: Uuid,
    /// The free-text request.
    pub description: String,
    /// Constraints and fixed preferences attached to the request.
    #[serde(default)]
    pub constraints: serde_json::Value,
    /// Current status.
    pub status: RunStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Set when the run reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// The last failure message, if the run failed.
    pub failure_reason: Option<String>,
}

impl PipelineRun {
    /// Creates a pending run for a request.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            constraints: serde_json::json!({}),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// Sets the request constraints.
    #[must_use]
    pub fn with_constraints(mut self, constraints: serde_json::Value) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Audit trail reported by a stage capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAudit {
    /// The raw request sent upstream.
    pub prompt: Option<String>,
    /// The raw response received.
    pub response: Option<String>,
    /// Resource cost (e.g. tokens).
    pub cost_units: Option<u64>,
}

/// One attempted invocation of a stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    /// Record identifier.
    pub id: Uuid,
    /// The owning run.
    pub run_id: Uuid,
    /// The stage invoked.
    pub stage: StageName,
    /// Execution status.
    pub status: ExecutionStatus,
    /// Input payload.
    pub input: serde_json::Value,
    /// Output payload, set on success.
    pub output: Option<serde_json::Value>,
    /// When the capability was invoked.
    pub started_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Error category on failure.
    pub error_category: Option<ErrorCategory>,
    /// Number of earlier invocations of the same stage in this run.
    pub retry_count: u32,
    /// Capability audit trail.
    #[serde(default)]
    pub audit: StageAudit,
}

impl StageExecutionRecord {
    /// Creates a queued record.
    #[must_use]
    pub fn queued(run_id: Uuid, stage: StageName, input: serde_json::Value, retry_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            status: ExecutionStatus::Queued,
            input,
            output: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            error: None,
            error_category: None,
            retry_count,
            audit: StageAudit::default(),
        }
    }

    /// Marks the record running.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the record completed with an output.
    pub fn complete(&mut self, output: serde_json::Value, audit: StageAudit) {
        self.status = ExecutionStatus::Completed;
        self.output = Some(output);
        self.audit = audit;
        self.finish();
    }

    /// Marks the record failed.
    pub fn fail(&mut self, error: impl Into<String>, category: ErrorCategory) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
        self.error_category = Some(category);
        self.finish();
    }

    fn finish(&mut self) {
        let ended = Utc::now();
        self.ended_at = Some(ended);
        self.duration_ms = self
            .started_at
            .map(|started| (ended - started).num_microseconds().unwrap_or(0) as f64 / 1000.0);
    }
}
