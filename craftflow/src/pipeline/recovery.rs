//! The single diagnose-and-rebuild attempt after a build failure.

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{StageExecutor, StageOutcome};
use crate::errors::Result;
use crate::stages::StageCapability;

/// A usable diagnosis returned by the recovery stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    /// The recovery stage's execution record.
    pub record_id: Uuid,
    /// Structured diagnosis of the failure.
    pub diagnosis: Value,
    /// Proposed fixes, passed to the rebuild as `patches`.
    pub fixes: Value,
}

impl RecoveryPlan {
    /// Returns the input of the rebuild.
    #[must_use]
    pub fn rebuild_input(&self, repo_path: &str) -> Value {
        json!({
            "repo_path": repo_path,
            "patches": self.fixes,
        })
    }
}

/// Runs the recovery stage on the build failure logs.
///
/// Returns `Some` when the diagnosis is usable and the build should be
/// retried once, `None` when the run should fail. A diagnosis is usable
/// when the recovery output satisfies its contract, which requires a
/// non-empty `diagnosis` object.
pub async fn attempt_recovery(
    executor: &StageExecutor,
    capability: &dyn StageCapability,
    run_id: Uuid,
    build_failure_logs: &str,
) -> Result<Option<RecoveryPlan>> {
    let input = json!({ "logs": build_failure_logs });
    match executor.execute(run_id, capability, input).await? {
        StageOutcome::Completed {
            record_id, output, ..
        } => {
            info!(%run_id, "Recovery produced a diagnosis, retrying build");
            Ok(Some(RecoveryPlan {
                record_id,
                diagnosis: output.get("diagnosis").cloned().unwrap_or_default(),
                fixes: output.get("fixes").cloned().unwrap_or_else(|| json!([])),
            }))
        }
        StageOutcome::Failed { error, .. } => {
            warn!(%run_id, error = %error, "Recovery produced no usable diagnosis");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CraftflowConfig;
    use crate::core::{PipelineRun, StageName};
    use crate::errors::StageError;
    use crate::events::NoOpEventSink;
    use crate::persistence::{InMemoryRunStore, RunStore};
    use crate::testing::{fixtures, ScriptedStage};
    use std::sync::Arc;

    async fn executor_with_run() -> (StageExecutor, Uuid) {
        let store = Arc::new(InMemoryRunStore::new());
        let run = PipelineRun::new("x");
        store.create_run(&run).await.unwrap();
        let executor = StageExecutor::new(
            store,
            Arc::new(NoOpEventSink),
            Arc::new(CraftflowConfig::default()),
        );
        (executor, run.id)
    }

    #[tokio::test]
    async fn test_usable_diagnosis() {
        let (executor, run_id) = executor_with_run().await;
        let recovery = ScriptedStage::always(
            StageName::RecoveryAgent,
            fixtures::output_for(StageName::RecoveryAgent),
        );

        let plan = attempt_recovery(&executor, &recovery, run_id, "missing dependency")
            .await
            .unwrap()
            .unwrap();

        assert!(plan.diagnosis.is_object());
        let rebuild = plan.rebuild_input("./projects/x");
        assert_eq!(rebuild["repo_path"], "./projects/x");
        assert!(rebuild["patches"].is_array());
        assert_eq!(recovery.last_input().unwrap()["logs"], "missing dependency");
    }

    #[tokio::test]
    async fn test_empty_diagnosis_is_not_usable() {
        let (executor, run_id) = executor_with_run().await;
        let recovery = ScriptedStage::always(
            StageName::RecoveryAgent,
            serde_json::json!({"diagnosis": {}, "fixes": []}),
        );

        let plan = attempt_recovery(&executor, &recovery, run_id, "boom").await.unwrap();
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn test_failed_recovery_stage() {
        let (executor, run_id) = executor_with_run().await;
        let recovery = ScriptedStage::new(StageName::RecoveryAgent)
            .then_err(StageError::malformed("not json"));

        let plan = attempt_recovery(&executor, &recovery, run_id, "boom").await.unwrap();
        assert!(plan.is_none());
    }
}
