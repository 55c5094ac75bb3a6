//! Core domain model types for craftflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run and execution status enums
//! - Stage identifiers
//! - Runs, execution records and artifacts
//! - Progress events

mod artifact;
mod event;
mod run;
mod stage_name;
mod status;

pub use artifact::{content_hash, Artifact};
pub use event::{EventKind, ProgressEvent};
pub use run::{PipelineRun, StageAudit, StageExecutionRecord};
pub use stage_name::{StageName, UnknownStageError};
pub use status::{ExecutionStatus, RunStatus};
