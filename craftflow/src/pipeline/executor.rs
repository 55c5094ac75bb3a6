//! Single-stage invocation with persistence, validation and events.

use dashmap::DashSet;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::panic_message;
use crate::config::CraftflowConfig;
use crate::core::{Artifact, ProgressEvent, StageExecutionRecord, StageName};
use crate::errors::{Result, StageError};
use crate::events::EventSink;
use crate::observability::stage_span;
use crate::persistence::RunStore;
use crate::stages::{extract_artifacts, StageCapability};

/// The result of one stage invocation.
///
/// A stage failure is a value, not an `Err`: the caller decides what it
/// means for the run.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The capability produced a valid output.
    Completed {
        /// The execution record.
        record_id: Uuid,
        /// The validated output.
        output: Value,
        /// Artifacts persisted from the output.
        artifacts: Vec<Artifact>,
    },
    /// The invocation failed.
    Failed {
        /// The execution record.
        record_id: Uuid,
        /// Why it failed.
        error: StageError,
    },
}

impl StageOutcome {
    /// Returns the execution record id.
    #[must_use]
    pub const fn record_id(&self) -> Uuid {
        match self {
            Self::Completed { record_id, .. } | Self::Failed { record_id, .. } => *record_id,
        }
    }

    /// Returns true for a completed invocation.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Returns the output of a completed invocation.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        match self {
            Self::Completed { output, .. } => Some(output),
            Self::Failed { .. } => None,
        }
    }

    /// Returns the error of a failed invocation.
    #[must_use]
    pub const fn error(&self) -> Option<&StageError> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Removes the `(run, stage)` claim when the invocation ends, including
/// when its future is dropped.
struct InFlightClaim<'a> {
    in_flight: &'a DashSet<(Uuid, StageName)>,
    key: (Uuid, StageName),
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Invokes stage capabilities on behalf of the coordinator.
///
/// Every invocation yields exactly one persisted execution record. The
/// executor never retries; retry belongs to the capability.
pub struct StageExecutor {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    config: Arc<CraftflowConfig>,
    in_flight: DashSet<(Uuid, StageName)>,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        config: Arc<CraftflowConfig>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// Returns true while the stage is executing for the run.
    #[must_use]
    pub fn is_running(&self, run_id: Uuid, stage: StageName) -> bool {
        self.in_flight.contains(&(run_id, stage))
    }

    /// Runs one stage invocation.
    ///
    /// Returns `Err` only when persistence fails; every stage-level
    /// failure, including a panic in the capability, is reported as
    /// [`StageOutcome::Failed`].
    pub async fn execute(
        &self,
        run_id: Uuid,
        capability: &dyn StageCapability,
        input: Value,
    ) -> Result<StageOutcome> {
        let stage = capability.stage();
        self.execute_inner(run_id, stage, capability, input)
            .instrument(stage_span(run_id, stage))
            .await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        stage: StageName,
        capability: &dyn StageCapability,
        input: Value,
    ) -> Result<StageOutcome> {
        let retry_count = self.prior_invocations(run_id, stage).await?;
        let mut record = StageExecutionRecord::queued(run_id, stage, input, retry_count);
        self.store.insert_record(&record).await?;

        let Some(_claim) = self.claim(run_id, stage) else {
            return self.fail(record, StageError::Busy { stage, run_id }).await;
        };

        if let Err(message) = capability.input_contract().validate(&record.input) {
            return self.fail(record, StageError::Validation { stage, message }).await;
        }

        record.start();
        self.store.update_record(&record).await?;
        self.events
            .emit(ProgressEvent::stage_started(run_id, stage, record.id))
            .await;
        info!(execution_id = %record.id, retry_count, "Stage started");

        let bound = self.config.stage_timeout(stage);
        let invocation = AssertUnwindSafe(capability.execute(record.input.clone())).catch_unwind();
        let result = match tokio::time::timeout(bound, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(StageError::Unhandled(format!(
                "capability panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(StageError::Timeout { stage, after: bound }),
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => return self.fail(record, error).await,
        };

        if let Err(message) = capability.output_contract().validate(&response.output) {
            record.audit = response.audit;
            return self
                .fail(record, StageError::OutputContractViolation { stage, message })
                .await;
        }

        let artifacts = extract_artifacts(
            &capability.artifact_rules(),
            stage,
            run_id,
            record.id,
            &response.output,
        );
        record.complete(response.output, response.audit);
        self.store.update_record(&record).await?;

        if !artifacts.is_empty() {
            self.store.insert_artifacts(&artifacts).await?;
            for artifact in &artifacts {
                self.events.emit(ProgressEvent::artifact_created(artifact)).await;
            }
        }

        let duration_ms = record.duration_ms.unwrap_or_default();
        self.events
            .emit(ProgressEvent::stage_completed(run_id, stage, record.id, duration_ms))
            .await;
        info!(
            execution_id = %record.id,
            duration_ms,
            artifacts = artifacts.len(),
            "Stage completed"
        );

        Ok(StageOutcome::Completed {
            record_id: record.id,
            output: record.output.unwrap_or_default(),
            artifacts,
        })
    }

    fn claim(&self, run_id: Uuid, stage: StageName) -> Option<InFlightClaim<'_>> {
        let key = (run_id, stage);
        if self.in_flight.insert(key) {
            Some(InFlightClaim {
                in_flight: &self.in_flight,
                key,
            })
        } else {
            None
        }
    }

    async fn prior_invocations(&self, run_id: Uuid, stage: StageName) -> Result<u32> {
        let records = self.store.list_records(run_id).await?;
        let count = records.iter().filter(|r| r.stage == stage).count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn fail(&self, mut record: StageExecutionRecord, error: StageError) -> Result<StageOutcome> {
        let message = error.to_string();
        record.fail(&message, error.category());
        self.store.update_record(&record).await?;
        self.events
            .emit(ProgressEvent::stage_failed(record.run_id, record.stage, record.id, &message))
            .await;
        warn!(
            execution_id = %record.id,
            category = %error.category(),
            error = %message,
            "Stage failed"
        );
        debug!(retry_count = record.retry_count, "Failure recorded");

        Ok(StageOutcome::Failed {
            record_id: record.id,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventKind, ExecutionStatus, PipelineRun};
    use crate::errors::{CraftflowError, ErrorCategory};
    use crate::events::CollectingEventSink;
    use crate::persistence::{InMemoryRunStore, MockRunStore, StoreError};
    use crate::stages::{FnCapability, StageContract, StageResponse};
    use crate::testing::{fixtures, PanickingStage, ScriptedStage, SlowStage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryRunStore>,
        events: Arc<CollectingEventSink>,
        executor: StageExecutor,
        run_id: Uuid,
    }

    async fn harness(config: CraftflowConfig) -> Harness {
        let store = Arc::new(InMemoryRunStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let run = PipelineRun::new("A todo app");
        store.create_run(&run).await.unwrap();
        let executor = StageExecutor::new(store.clone(), events.clone(), Arc::new(config));
        Harness {
            store,
            events,
            executor,
            run_id: run.id,
        }
    }

    #[tokio::test]
    async fn test_success_persists_record_artifacts_and_events() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = ScriptedStage::always(StageName::DbDesigner, fixtures::output_for(StageName::DbDesigner));

        let outcome = h
            .executor
            .execute(h.run_id, &capability, json!({"entities": []}))
            .await
            .unwrap();

        let StageOutcome::Completed { record_id, artifacts, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(artifacts.len(), 2);

        let records = h.store.list_records(h.run_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record_id);
        assert_eq!(records[0].status, ExecutionStatus::Completed);
        assert!(records[0].duration_ms.is_some());
        assert_eq!(h.store.list_artifacts(h.run_id).await.unwrap().len(), 2);

        let kinds: Vec<_> = h.events.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StageStarted,
                EventKind::ArtifactCreated,
                EventKind::ArtifactCreated,
                EventKind::StageCompleted,
            ]
        );
        assert!(!h.executor.is_running(h.run_id, StageName::DbDesigner));
    }

    #[tokio::test]
    async fn test_invalid_input_never_runs() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = ScriptedStage::always(StageName::Builder, fixtures::output_for(StageName::Builder));

        let outcome = h.executor.execute(h.run_id, &capability, json!({})).await.unwrap();

        assert!(matches!(outcome.error(), Some(StageError::Validation { .. })));
        assert_eq!(capability.calls(), 0);

        let records = h.store.list_records(h.run_id).await.unwrap();
        assert_eq!(records[0].status, ExecutionStatus::Failed);
        assert!(records[0].started_at.is_none());
        assert_eq!(records[0].error_category, Some(ErrorCategory::Validation));

        let kinds: Vec<_> = h.events.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::StageFailed]);
    }

    #[tokio::test]
    async fn test_invalid_output_is_a_stage_failure() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = ScriptedStage::always(StageName::ApiDesigner, json!({"openapi_yaml": "not a spec"}));

        let outcome = h
            .executor
            .execute(h.run_id, &capability, json!({"project_spec": {}}))
            .await
            .unwrap();

        assert!(matches!(
            outcome.error(),
            Some(StageError::OutputContractViolation { .. })
        ));
        let records = h.store.list_records(h.run_id).await.unwrap();
        assert!(records[0].output.is_none());
        assert!(h.store.list_artifacts(h.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capability_error_is_recorded() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = ScriptedStage::new(StageName::QaAgent)
            .then_err(StageError::upstream("connection refused"));

        let outcome = h
            .executor
            .execute(h.run_id, &capability, json!({"endpoints": {}}))
            .await
            .unwrap();

        assert_eq!(
            outcome.error(),
            Some(&StageError::upstream("connection refused"))
        );
        let records = h.store.list_records(h.run_id).await.unwrap();
        assert_eq!(records[0].error.as_deref(), Some("Upstream failure: connection refused"));
        assert_eq!(records[0].error_category, Some(ErrorCategory::Upstream));

        let failed = h.events.events_of_kind(EventKind::StageFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["error"], "Upstream failure: connection refused");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = PanickingStage::new(StageName::Deployer, "socket closed");

        let outcome = h
            .executor
            .execute(h.run_id, &capability, json!({"artifacts": [], "target": "docker-compose"}))
            .await
            .unwrap();

        let Some(StageError::Unhandled(message)) = outcome.error() else {
            panic!("expected unhandled error");
        };
        assert!(message.contains("socket closed"));
        assert!(!h.executor.is_running(h.run_id, StageName::Deployer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_uses_stage_bound() {
        let config = CraftflowConfig::default().with_stage_timeout(StageName::Builder, Duration::from_secs(5));
        let h = harness(config).await;
        let capability = SlowStage::new(
            StageName::Builder,
            Duration::from_secs(60),
            fixtures::output_for(StageName::Builder),
        );

        let outcome = h
            .executor
            .execute(h.run_id, &capability, json!({"repo_path": "./projects/x"}))
            .await
            .unwrap();

        assert_eq!(
            outcome.error(),
            Some(&StageError::Timeout {
                stage: StageName::Builder,
                after: Duration::from_secs(5),
            })
        );
        let records = h.store.list_records(h.run_id).await.unwrap();
        assert_eq!(records[0].error_category, Some(ErrorCategory::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_stage_same_run_is_refused() {
        let h = harness(CraftflowConfig::default()).await;
        let slow = SlowStage::new(
            StageName::Builder,
            Duration::from_secs(10),
            fixtures::output_for(StageName::Builder),
        );
        let input = json!({"repo_path": "./projects/x"});

        let (first, second) = tokio::join!(
            h.executor.execute(h.run_id, &slow, input.clone()),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                h.executor.execute(h.run_id, &slow, input.clone()).await
            }
        );

        assert!(first.unwrap().is_completed());
        assert!(matches!(second.unwrap().error(), Some(StageError::Busy { .. })));

        let records = h.store.list_records(h.run_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_count_tracks_prior_invocations() {
        let h = harness(CraftflowConfig::default()).await;
        let capability = ScriptedStage::new(StageName::Builder)
            .then_err(StageError::upstream("missing dependency"))
            .then_ok(fixtures::output_for(StageName::Builder));
        let input = json!({"repo_path": "./projects/x"});

        h.executor.execute(h.run_id, &capability, input.clone()).await.unwrap();
        h.executor.execute(h.run_id, &capability, input).await.unwrap();

        let counts: Vec<_> = h
            .store
            .list_records(h.run_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.retry_count)
            .collect();
        assert_eq!(counts, vec![0, 1]);
    }

    #[derive(Debug)]
    struct StrictCapability;

    #[async_trait]
    impl StageCapability for StrictCapability {
        fn stage(&self) -> StageName {
            StageName::InfraEngineer
        }

        fn output_contract(&self) -> StageContract {
            StageContract::output_for(StageName::InfraEngineer)
                .require("dockerfile", crate::stages::FieldKind::NonEmptyString)
        }

        async fn execute(&self, _input: Value) -> std::result::Result<StageResponse, StageError> {
            Ok(StageResponse::new(json!({"docker_compose": "services: {}"})))
        }
    }

    #[tokio::test]
    async fn test_capability_can_override_contracts() {
        let h = harness(CraftflowConfig::default()).await;
        let outcome = h
            .executor
            .execute(h.run_id, &StrictCapability, json!({"services": []}))
            .await
            .unwrap();

        let Some(StageError::OutputContractViolation { message, .. }) = outcome.error() else {
            panic!("expected contract violation");
        };
        assert!(message.contains("dockerfile"));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let mut store = MockRunStore::new();
        store.expect_list_records().returning(|_| Ok(Vec::new()));
        store
            .expect_insert_record()
            .returning(|_| Err(StoreError::Backend("disk full".into())));

        let executor = StageExecutor::new(
            Arc::new(store),
            Arc::new(CollectingEventSink::new()),
            Arc::new(CraftflowConfig::default()),
        );
        let capability = FnCapability::new(StageName::Builder, |_| Ok(json!({})));

        let err = executor
            .execute(Uuid::new_v4(), &capability, json!({"repo_path": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CraftflowError::Store(StoreError::Backend(_))));
    }
}
