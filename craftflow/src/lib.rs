//! # Craftflow
//!
//! A pipeline coordinator that turns a natural-language project request
//! into a generated, built and deployed project by driving a fixed graph
//! of LLM-backed stages.
//!
//! Craftflow provides:
//!
//! - **A run state machine**: `pending` through `completed`, with `failed`
//!   reachable from every non-terminal status
//! - **Stage execution wrapping**: every capability call is validated,
//!   bounded in time, persisted as one execution record and announced as
//!   progress events
//! - **Per-run event fan-out**: observers subscribe to one run and never
//!   slow the pipeline down
//! - **Build recovery**: a failed build gets one diagnosis and one rebuild
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use craftflow::prelude::*;
//!
//! let supervisor = RunSupervisor::new(
//!     Arc::new(InMemoryRunStore::new()),
//!     registry, // one StageCapability per StageName
//!     CraftflowConfig::from_env()?,
//! )?;
//!
//! let run = supervisor.create_run("A todo app with user auth", json!({})).await?;
//! let mut progress = supervisor.subscribe_to_run(run.id);
//! supervisor.start_run(run.id).await?;
//!
//! while let Some(event) = progress.recv().await {
//!     println!("{}", event.to_json()?);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{CraftflowConfig, LogFormat, LoggingConfig, ServicePort};
    pub use crate::core::{
        Artifact, EventKind, ExecutionStatus, PipelineRun, ProgressEvent, RunStatus,
        StageAudit, StageExecutionRecord, StageName,
    };
    pub use crate::errors::{CraftflowError, ErrorCategory, StageError};
    pub use crate::events::{
        CollectingEventSink, EventBroadcaster, EventSink, LoggingEventSink, NoOpEventSink,
        Subscription,
    };
    pub use crate::observability::init_logging;
    pub use crate::persistence::{InMemoryRunStore, RunStore, StoreError};
    pub use crate::pipeline::{
        PipelineCoordinator, RunReport, RunSnapshot, RunSupervisor, StageExecutor, StageOutcome,
    };
    pub use crate::stages::{
        ArtifactRule, FnCapability, StageCapability, StageContract, StageRegistry, StageResponse,
    };
}
