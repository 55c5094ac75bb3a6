//! Persistence seam for runs, execution records and artifacts.
//!
//! The coordinator treats storage as an external collaborator. Every
//! mutation is a discrete, independently committed operation; nothing
//! holds a transaction across a whole run.

mod memory;

pub use memory::InMemoryRunStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Artifact, PipelineRun, StageExecutionRecord};

/// Errors reported by a [`RunStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("run", "record").
        entity: &'static str,
        /// Identifier looked up.
        id: Uuid,
    },

    /// The write conflicts with stored state.
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// The backend failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a not-found error for a run.
    #[must_use]
    pub const fn run_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "run", id }
    }

    /// Creates a not-found error for an execution record.
    #[must_use]
    pub const fn record_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "record", id }
    }
}

/// Durable storage for pipeline state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a new run.
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a run.
    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError>;

    /// Overwrites a stored run.
    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Lists all runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError>;

    /// Persists a new execution record.
    async fn insert_record(&self, record: &StageExecutionRecord) -> Result<(), StoreError>;

    /// Overwrites a stored execution record.
    ///
    /// Implementations reject status changes that the record lifecycle does
    /// not allow (e.g. `completed → running`).
    async fn update_record(&self, record: &StageExecutionRecord) -> Result<(), StoreError>;

    /// Lists the records of a run in insertion order.
    async fn list_records(&self, run_id: Uuid) -> Result<Vec<StageExecutionRecord>, StoreError>;

    /// Persists artifacts.
    async fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<(), StoreError>;

    /// Lists the artifacts of a run in insertion order.
    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>, StoreError>;
}
