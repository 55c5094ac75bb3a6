//! Progress events published to run observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Artifact, RunStatus, StageName};

/// The kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The run moved to a new status.
    RunStatusChanged,
    /// A stage execution began.
    StageStarted,
    /// A stage execution produced a valid output.
    StageCompleted,
    /// A stage execution failed.
    StageFailed,
    /// An artifact was persisted.
    ArtifactCreated,
    /// The run failed; carries a human-readable message.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStatusChanged => write!(f, "run_status_changed"),
            Self::StageStarted => write!(f, "stage_started"),
            Self::StageCompleted => write!(f, "stage_completed"),
            Self::StageFailed => write!(f, "stage_failed"),
            Self::ArtifactCreated => write!(f, "artifact_created"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// An ephemeral, best-effort notification about a run.
///
/// Events are never persisted or replayed. Observers that subscribe late
/// only see events published after they subscribed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// The run the event belongs to.
    pub run_id: Uuid,

    /// Structured payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, run_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind,
            run_id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Creates a `run_status_changed` event.
    #[must_use]
    pub fn run_status_changed(run_id: Uuid, status: RunStatus) -> Self {
        Self::new(
            EventKind::RunStatusChanged,
            run_id,
            serde_json::json!({ "status": status }),
        )
    }

    /// Creates a `stage_started` event.
    #[must_use]
    pub fn stage_started(run_id: Uuid, stage: StageName, execution_id: Uuid) -> Self {
        Self::new(
            EventKind::StageStarted,
            run_id,
            serde_json::json!({
                "stage": stage,
                "execution_id": execution_id,
            }),
        )
    }

    /// Creates a `stage_completed` event.
    #[must_use]
    pub fn stage_completed(
        run_id: Uuid,
        stage: StageName,
        execution_id: Uuid,
        duration_ms: f64,
    ) -> Self {
        Self::new(
            EventKind::StageCompleted,
            run_id,
            serde_json::json!({
                "stage": stage,
                "execution_id": execution_id,
                "duration_ms": duration_ms,
            }),
        )
    }

    /// Creates a `stage_failed` event.
    #[must_use]
    pub fn stage_failed(run_id: Uuid, stage: StageName, execution_id: Uuid, error: &str) -> Self {
        Self::new(
            EventKind::StageFailed,
            run_id,
            serde_json::json!({
                "stage": stage,
                "execution_id": execution_id,
                "error": error,
            }),
        )
    }

    /// Creates an `artifact_created` event.
    #[must_use]
    pub fn artifact_created(artifact: &Artifact) -> Self {
        Self::new(
            EventKind::ArtifactCreated,
            artifact.run_id,
            serde_json::json!({
                "artifact_id": artifact.id,
                "execution_id": artifact.execution_id,
                "artifact_type": artifact.artifact_type,
                "name": artifact.name,
                "content_hash": artifact.content_hash,
            }),
        )
    }

    /// Creates an `error` event.
    #[must_use]
    pub fn error(run_id: Uuid, message: &str) -> Self {
        Self::new(
            EventKind::Error,
            run_id,
            serde_json::json!({ "message": message }),
        )
    }

    /// Returns the `stage` field of the payload, if present.
    #[must_use]
    pub fn stage(&self) -> Option<StageName> {
        self.data
            .get("stage")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Returns the `status` field of a `run_status_changed` payload.
    #[must_use]
    pub fn status(&self) -> Option<RunStatus> {
        if self.kind != EventKind::RunStatusChanged {
            return None;
        }
        self.data
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Serializes the event into the observer wire format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
