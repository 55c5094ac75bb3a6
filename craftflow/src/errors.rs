//! Error types for craftflow.
//!
//! Stage-level failures ([`StageError`]) are values that flow back to the
//! coordinator, which decides what they mean for the run. Crate-level
//! failures ([`CraftflowError`]) cover persistence, state-machine and
//! supervision errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{RunStatus, StageName};
use crate::persistence::StoreError;

/// Category of a stage failure, persisted on the execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input contract violation.
    Validation,
    /// Output contract violation.
    OutputContract,
    /// Upstream dependency failed after internal retries.
    Upstream,
    /// Upstream answered with something unparseable.
    MalformedResponse,
    /// The stage or an external process exceeded its bound.
    Timeout,
    /// The same stage was already running for this run.
    Busy,
    /// Anything else, including panics.
    Unhandled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::OutputContract => write!(f, "output_contract"),
            Self::Upstream => write!(f, "upstream"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::Timeout => write!(f, "timeout"),
            Self::Busy => write!(f, "busy"),
            Self::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// Why a single stage invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The input did not satisfy the stage's input contract.
    #[error("Invalid input for {stage}: {message}")]
    Validation {
        /// The stage.
        stage: StageName,
        /// What was wrong.
        message: String,
    },

    /// The output did not satisfy the stage's output contract.
    #[error("Invalid output from {stage}: {message}")]
    OutputContractViolation {
        /// The stage.
        stage: StageName,
        /// What was wrong.
        message: String,
    },

    /// The capability's upstream dependency failed after its own retries.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// The upstream response could not be parsed.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The stage exceeded its time bound.
    #[error("{stage} timed out after {}s", .after.as_secs_f64())]
    Timeout {
        /// The stage.
        stage: StageName,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The stage is already running for this run.
    #[error("{stage} is already running for run {run_id}")]
    Busy {
        /// The stage.
        stage: StageName,
        /// The run.
        run_id: Uuid,
    },

    /// Any other failure, including a panic inside the capability.
    #[error("Unhandled stage error: {0}")]
    Unhandled(String),
}

impl StageError {
    /// Creates an upstream error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Creates a malformed response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Returns the persisted category for this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::OutputContractViolation { .. } => ErrorCategory::OutputContract,
            Self::Upstream(_) => ErrorCategory::Upstream,
            Self::MalformedResponse(_) => ErrorCategory::MalformedResponse,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Busy { .. } => ErrorCategory::Busy,
            Self::Unhandled(_) => ErrorCategory::Unhandled,
        }
    }
}

/// The main error type for craftflow operations.
#[derive(Debug, Error)]
pub enum CraftflowError {
    /// Persistence failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The state machine does not allow this transition.
    #[error("Invalid run transition {from} -> {to} for run {run_id}")]
    InvalidTransition {
        /// The run.
        run_id: Uuid,
        /// Current status.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },

    /// The run does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// A task for the run is still in flight.
    #[error("Run {0} is already active")]
    RunAlreadyActive(Uuid),

    /// Only failed runs can be retried.
    #[error("Run {run_id} cannot be retried from status {status}")]
    RunNotRetryable {
        /// The run.
        run_id: Uuid,
        /// Its current status.
        status: RunStatus,
    },

    /// No capability is registered for a stage.
    #[error("No capability registered for stage {0}")]
    MissingStage(StageName),

    /// One or both branches of a fan-out failed.
    #[error("Fan-out failed: {}", format_failures(.failures))]
    Aggregation {
        /// The failed branches.
        failures: Vec<(StageName, StageError)>,
    },

    /// Any other failure inside a run.
    #[error("{0}")]
    Unhandled(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_failures(failures: &[(StageName, StageError)]) -> String {
    failures
        .iter()
        .map(|(stage, err)| format!("{stage}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias.
pub type Result<T, E = CraftflowError> = std::result::Result<T, E>;
