//! In-memory run store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{RunStore, StoreError};
use crate::core::{Artifact, PipelineRun, StageExecutionRecord};

/// In-memory [`RunStore`], suitable for tests and single-process use.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    run_order: RwLock<Vec<Uuid>>,
    records: RwLock<HashMap<Uuid, Vec<StageExecutionRecord>>>,
    artifacts: RwLock<HashMap<Uuid, Vec<Artifact>>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if no run is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        self.run_order.write().push(run.id);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(run_id))
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        match self.runs.write().get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::run_not_found(run.id)),
        }
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let runs = self.runs.read();
        Ok(self
            .run_order
            .read()
            .iter()
            .filter_map(|id| runs.get(id).cloned())
            .collect())
    }

    async fn insert_record(&self, record: &StageExecutionRecord) -> Result<(), StoreError> {
        if !self.runs.read().contains_key(&record.run_id) {
            return Err(StoreError::run_not_found(record.run_id));
        }
        let mut records = self.records.write();
        let run_records = records.entry(record.run_id).or_default();
        if run_records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Conflict(format!("record {} already exists", record.id)));
        }
        run_records.push(record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &StageExecutionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(&record.run_id)
            .and_then(|run_records| run_records.iter_mut().find(|r| r.id == record.id))
            .ok_or_else(|| StoreError::record_not_found(record.id))?;

        if stored.status != record.status && !stored.status.can_transition_to(record.status) {
            return Err(StoreError::Conflict(format!(
                "record {} cannot move from {} to {}",
                record.id, stored.status, record.status
            )));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn list_records(&self, run_id: Uuid) -> Result<Vec<StageExecutionRecord>, StoreError> {
        Ok(self.records.read().get(&run_id).cloned().unwrap_or_default())
    }

    async fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        let runs = self.runs.read();
        if let Some(orphan) = artifacts.iter().find(|a| !runs.contains_key(&a.run_id)) {
            return Err(StoreError::run_not_found(orphan.run_id));
        }
        let mut stored = self.artifacts.write();
        for artifact in artifacts {
            stored.entry(artifact.run_id).or_default().push(artifact.clone());
        }
        Ok(())
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        Ok(self.artifacts.read().get(&run_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, RunStatus, StageAudit, StageName};
    use crate::errors::ErrorCategory;

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = InMemoryRunStore::new();
        let mut run = PipelineRun::new("A blog platform");
        store.create_run(&run).await.unwrap();

        run.status = RunStatus::Analyzing;
        store.update_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Analyzing);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_run_conflicts() {
        let store = InMemoryRunStore::new();
        let run = PipelineRun::new("dup");
        store.create_run(&run).await.unwrap();

        let err = store.create_run(&run).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_run() {
        let store = InMemoryRunStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.get_run(id).await.unwrap_err(), StoreError::run_not_found(id));
        assert!(store.update_run(&PipelineRun::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_runs_in_creation_order() {
        let store = InMemoryRunStore::new();
        let first = PipelineRun::new("first");
        let second = PipelineRun::new("second");
        store.create_run(&first).await.unwrap();
        store.create_run(&second).await.unwrap();

        let ids: Vec<_> = store.list_runs().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_record_lifecycle_enforced() {
        let store = InMemoryRunStore::new();
        let run = PipelineRun::new("records");
        store.create_run(&run).await.unwrap();

        let mut record = StageExecutionRecord::queued(run.id, StageName::Builder, serde_json::json!({}), 0);
        store.insert_record(&record).await.unwrap();

        record.start();
        store.update_record(&record).await.unwrap();
        record.complete(serde_json::json!({"status": "success"}), StageAudit::default());
        store.update_record(&record).await.unwrap();

        let mut stale = record.clone();
        stale.status = ExecutionStatus::Running;
        assert!(matches!(
            store.update_record(&stale).await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        let records = store.list_records(run.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_record_requires_existing_run() {
        let store = InMemoryRunStore::new();
        let mut record =
            StageExecutionRecord::queued(Uuid::new_v4(), StageName::QaAgent, serde_json::json!({}), 0);
        assert!(store.insert_record(&record).await.is_err());

        record.fail("x", ErrorCategory::Unhandled);
        assert!(matches!(
            store.update_record(&record).await.unwrap_err(),
            StoreError::NotFound { entity: "record", .. }
        ));
    }

    #[tokio::test]
    async fn test_artifacts_scoped_by_run() {
        let store = InMemoryRunStore::new();
        let a = PipelineRun::new("a");
        let b = PipelineRun::new("b");
        store.create_run(&a).await.unwrap();
        store.create_run(&b).await.unwrap();

        store
            .insert_artifacts(&[
                Artifact::new(a.id, None, "sql", "migration.sql", "CREATE TABLE a();"),
                Artifact::new(b.id, None, "sql", "migration.sql", "CREATE TABLE b();"),
            ])
            .await
            .unwrap();

        let artifacts = store.list_artifacts(a.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].content, "CREATE TABLE a();");
    }

    #[tokio::test]
    async fn test_orphan_artifact_rejected() {
        let store = InMemoryRunStore::new();
        let artifact = Artifact::new(Uuid::new_v4(), None, "code", "main.py", "");
        assert!(store.insert_artifacts(&[artifact]).await.is_err());
    }
}
