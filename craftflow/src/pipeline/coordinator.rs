//! The run state machine.
//!
//! ```text
//! pending -> analyzing -> designing -> generating -> building -> deploying -> completed
//!     \__________\___________\____________\____________\____________\-> failed
//! ```
//!
//! | status     | stages invoked                                          |
//! |------------|---------------------------------------------------------|
//! | analyzing  | requirement interpreter                                 |
//! | designing  | system architect, then api + db designers concurrently |
//! | generating | backend + frontend generators concurrently, then infra |
//! | building   | builder, recovery agent + one rebuild on failure        |
//! | deploying  | deployer, then qa agent (never fails the run)           |

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use super::recovery::attempt_recovery;
use super::{panic_message, StageExecutor, StageOutcome};
use crate::config::CraftflowConfig;
use crate::core::{
    Artifact, ExecutionStatus, PipelineRun, ProgressEvent, RunStatus, StageName,
};
use crate::errors::{CraftflowError, ErrorCategory, Result, StageError};
use crate::events::EventSink;
use crate::observability::{run_span, SpanTimer};
use crate::persistence::{RunStore, StoreError};
use crate::stages::StageRegistry;

/// Summary of one coordinator pass over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run.
    pub run_id: Uuid,
    /// Terminal status.
    pub status: RunStatus,
    /// Failure reason, if the run failed.
    pub failure_reason: Option<String>,
    /// Statuses entered during this pass, in order.
    pub visited: Vec<RunStatus>,
    /// Whether the recovery cycle ran.
    pub recovery_attempted: bool,
}

/// Why a pass stopped before completing.
enum Halt {
    /// A stage (or fan-out) failed.
    Stage(String),
    /// Infrastructure failed.
    Error(CraftflowError),
}

impl From<CraftflowError> for Halt {
    fn from(error: CraftflowError) -> Self {
        Self::Error(error)
    }
}

impl Halt {
    fn stage(stage: StageName, error: &StageError) -> Self {
        Self::Stage(format!("Failed to {}: {error}", stage.label()))
    }

    fn into_reason(self) -> String {
        match self {
            Self::Stage(reason) => reason,
            Self::Error(error) => error.to_string(),
        }
    }
}

struct RunState {
    run: PipelineRun,
    visited: Vec<RunStatus>,
    recovery_attempted: bool,
}

/// Drives runs through the fixed stage graph.
///
/// A run is the only thing the coordinator mutates, and only at status
/// transitions. Each transition is persisted before its
/// `run_status_changed` event is published, and both happen before the
/// next stage starts.
pub struct PipelineCoordinator {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    registry: StageRegistry,
    executor: StageExecutor,
    config: Arc<CraftflowConfig>,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("stages", &self.registry.len())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Creates a coordinator. Every stage must have a capability.
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        registry: StageRegistry,
        config: CraftflowConfig,
    ) -> Result<Self> {
        registry.ensure_complete()?;
        config.validate()?;
        let config = Arc::new(config);
        let executor = StageExecutor::new(store.clone(), events.clone(), config.clone());
        Ok(Self {
            store,
            events,
            registry,
            executor,
            config,
        })
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CraftflowConfig {
        &self.config
    }

    /// Returns the stage executor.
    #[must_use]
    pub const fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Loads a run, mapping a missing run to [`CraftflowError::RunNotFound`].
    pub async fn load_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        self.store.get_run(run_id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => CraftflowError::RunNotFound(run_id),
            other => CraftflowError::Store(other),
        })
    }

    /// Drives a pending run to a terminal status.
    ///
    /// Stage failures and unexpected errors, including panics, end the run
    /// as `failed` and are reported through the returned [`RunReport`].
    /// `Err` means the run was not pending, or the failure itself could not
    /// be persisted.
    pub async fn run(&self, run_id: Uuid) -> Result<RunReport> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(CraftflowError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Analyzing,
            });
        }

        let timer = SpanTimer::start("pipeline_run");
        let mut state = RunState {
            run,
            visited: Vec::new(),
            recovery_attempted: false,
        };

        let outcome = AssertUnwindSafe(self.drive(&mut state).instrument(run_span(run_id)))
            .catch_unwind()
            .await;
        let halted = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(halt)) => Some(halt.into_reason()),
            Err(panic) => Some(format!("Unhandled error: {}", panic_message(&*panic))),
        };

        if let Some(reason) = halted {
            if self.fail_run(run_id, &reason).await? {
                state.visited.push(RunStatus::Failed);
            }
            state.run.status = RunStatus::Failed;
            state.run.failure_reason = Some(reason);
        }

        info!(
            %run_id,
            status = %state.run.status,
            duration_ms = timer.finish(),
            recovery_attempted = state.recovery_attempted,
            "Pipeline run finished"
        );

        Ok(RunReport {
            run_id,
            status: state.run.status,
            failure_reason: state.run.failure_reason,
            visited: state.visited,
            recovery_attempted: state.recovery_attempted,
        })
    }

    /// Moves a run to `failed` with a reason.
    ///
    /// Records still running are failed with the same reason first. Returns
    /// `false` without doing anything if the run is already terminal.
    pub async fn fail_run(&self, run_id: Uuid, reason: &str) -> Result<bool> {
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }

        if let Err(e) = self.fail_running_records(run_id, reason).await {
            warn!(%run_id, error = %e, "Could not fail running records");
        }

        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.failure_reason = Some(reason.to_string());
        run.updated_at = now;
        run.completed_at = Some(now);
        self.store.update_run(&run).await?;

        error!(%run_id, reason, "Pipeline run failed");
        self.events
            .emit(ProgressEvent::run_status_changed(run_id, RunStatus::Failed))
            .await;
        self.events.emit(ProgressEvent::error(run_id, reason)).await;
        Ok(true)
    }

    async fn fail_running_records(&self, run_id: Uuid, reason: &str) -> Result<()> {
        let records = self.store.list_records(run_id).await?;
        for mut record in records
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Running)
        {
            record.fail(reason, ErrorCategory::Unhandled);
            self.store.update_record(&record).await?;
            self.events
                .emit(ProgressEvent::stage_failed(run_id, record.stage, record.id, reason))
                .await;
        }
        Ok(())
    }

    async fn transition(&self, state: &mut RunState, to: RunStatus) -> Result<()> {
        let from = state.run.status;
        if !from.can_transition_to(to) {
            return Err(CraftflowError::InvalidTransition {
                run_id: state.run.id,
                from,
                to,
            });
        }

        let now = Utc::now();
        state.run.status = to;
        state.run.updated_at = now;
        if to.is_terminal() {
            state.run.completed_at = Some(now);
        }
        self.store.update_run(&state.run).await?;
        state.visited.push(to);

        info!(run_id = %state.run.id, %from, %to, "Run status changed");
        self.events
            .emit(ProgressEvent::run_status_changed(state.run.id, to))
            .await;
        Ok(())
    }

    async fn drive(&self, state: &mut RunState) -> std::result::Result<(), Halt> {
        let run_id = state.run.id;

        self.transition(state, RunStatus::Analyzing).await?;
        let spec = self
            .run_stage(
                run_id,
                StageName::RequirementInterpreter,
                json!({
                    "raw_text": state.run.description,
                    "constraints": state.run.constraints,
                }),
            )
            .await?;

        self.transition(state, RunStatus::Designing).await?;
        let architecture = self
            .run_stage(run_id, StageName::SystemArchitect, json!({ "project_spec": spec }))
            .await?;

        let (api, db) = self
            .fan_out(
                run_id,
                (
                    StageName::ApiDesigner,
                    json!({ "project_spec": spec, "architecture": architecture }),
                ),
                (
                    StageName::DbDesigner,
                    json!({
                        "entities": spec.get("entities").cloned().unwrap_or_else(|| json!([])),
                    }),
                ),
            )
            .await?;

        self.transition(state, RunStatus::Generating).await?;
        let openapi_yaml = api.get("openapi_yaml").cloned().unwrap_or_default();
        let sql_migration = db.get("sql_migration").cloned().unwrap_or_default();
        let (backend, frontend) = self
            .fan_out(
                run_id,
                (
                    StageName::BackendGenerator,
                    json!({
                        "openapi_yaml": openapi_yaml,
                        "sql_migration": sql_migration,
                        "architecture": architecture,
                    }),
                ),
                (
                    StageName::FrontendGenerator,
                    json!({
                        "openapi_yaml": openapi_yaml,
                        "sql_migration": sql_migration,
                        "architecture": architecture,
                        "ui_preferences": {},
                    }),
                ),
            )
            .await?;

        self.run_stage(
            run_id,
            StageName::InfraEngineer,
            json!({
                "services": self.config.services,
                "backend_files": backend.get("files").cloned().unwrap_or_default(),
                "frontend_files": frontend.get("files").cloned().unwrap_or_default(),
            }),
        )
        .await?;

        self.transition(state, RunStatus::Building).await?;
        let build = self.build_with_recovery(state).await?;

        self.transition(state, RunStatus::Deploying).await?;
        let deploy = self
            .run_stage(
                run_id,
                StageName::Deployer,
                json!({
                    "artifacts": build.get("artifacts").cloned().unwrap_or_else(|| json!([])),
                    "target": self.config.deploy_target,
                }),
            )
            .await?;
        if reports_failure(&deploy) {
            return Err(Halt::Stage(format!(
                "Deployment failed: {}",
                detail(&deploy, "deployer reported failure")
            )));
        }

        self.run_qa(
            run_id,
            deploy.get("endpoints").cloned().unwrap_or_else(|| json!({})),
        )
        .await?;

        self.transition(state, RunStatus::Completed).await?;
        Ok(())
    }

    async fn run_stage(
        &self,
        run_id: Uuid,
        stage: StageName,
        input: Value,
    ) -> std::result::Result<Value, Halt> {
        let capability = self.registry.get(stage)?;
        match self.executor.execute(run_id, capability.as_ref(), input).await? {
            StageOutcome::Completed { output, .. } => Ok(output),
            StageOutcome::Failed { error, .. } => Err(Halt::stage(stage, &error)),
        }
    }

    /// Runs two independent stages concurrently and waits for both.
    /// Either failing fails the whole step.
    async fn fan_out(
        &self,
        run_id: Uuid,
        (left_stage, left_input): (StageName, Value),
        (right_stage, right_input): (StageName, Value),
    ) -> std::result::Result<(Value, Value), Halt> {
        let left_capability = self.registry.get(left_stage)?;
        let right_capability = self.registry.get(right_stage)?;

        let (left, right) = tokio::join!(
            self.executor.execute(run_id, left_capability.as_ref(), left_input),
            self.executor.execute(run_id, right_capability.as_ref(), right_input),
        );

        match (left?, right?) {
            (
                StageOutcome::Completed { output: left, .. },
                StageOutcome::Completed { output: right, .. },
            ) => Ok((left, right)),
            (left, right) => {
                let failures = [(left_stage, left), (right_stage, right)]
                    .into_iter()
                    .filter_map(|(stage, outcome)| match outcome {
                        StageOutcome::Failed { error, .. } => Some((stage, error)),
                        StageOutcome::Completed { .. } => None,
                    })
                    .collect();
                Err(Halt::Error(CraftflowError::Aggregation { failures }))
            }
        }
    }

    /// Runs the build, then on failure at most one recovery and one rebuild.
    async fn build_with_recovery(&self, state: &mut RunState) -> std::result::Result<Value, Halt> {
        let run_id = state.run.id;
        let repo_path = self.config.project_path(run_id).to_string_lossy().into_owned();

        let logs = match self.build(run_id, json!({ "repo_path": repo_path })).await? {
            Ok(output) => return Ok(output),
            Err(logs) => logs,
        };

        state.recovery_attempted = true;
        let recovery = self.registry.get(StageName::RecoveryAgent)?;
        let Some(plan) = attempt_recovery(&self.executor, recovery.as_ref(), run_id, &logs).await?
        else {
            return Err(Halt::Stage(format!("Build failed: {logs}")));
        };

        match self.build(run_id, plan.rebuild_input(&repo_path)).await? {
            Ok(output) => Ok(output),
            Err(logs) => Err(Halt::Stage(format!("Build failed after recovery: {logs}"))),
        }
    }

    /// Returns the build output, or the failure logs.
    async fn build(
        &self,
        run_id: Uuid,
        input: Value,
    ) -> Result<std::result::Result<Value, String>> {
        let builder = self.registry.get(StageName::Builder)?;
        Ok(match self.executor.execute(run_id, builder.as_ref(), input).await? {
            StageOutcome::Completed { output, .. } if reports_failure(&output) => {
                Err(detail(&output, "builder reported failure"))
            }
            StageOutcome::Completed { output, .. } => Ok(output),
            StageOutcome::Failed { error, .. } => Err(error.to_string()),
        })
    }

    /// Runs QA. Its failure is recorded as a `qa_report` artifact and never
    /// fails the run.
    async fn run_qa(&self, run_id: Uuid, endpoints: Value) -> Result<()> {
        let qa = self.registry.get(StageName::QaAgent)?;
        let outcome = self
            .executor
            .execute(run_id, qa.as_ref(), json!({ "endpoints": endpoints }))
            .await?;

        if let StageOutcome::Failed { record_id, error } = outcome {
            warn!(%run_id, error = %error, "QA failed, completing run anyway");
            let report = json!({ "status": "failed", "error": error.to_string() });
            let artifact = Artifact::new(
                run_id,
                Some(record_id),
                "qa_report",
                "qa_report.json",
                serde_json::to_string_pretty(&report)?,
            )
            .with_metadata(json!({ "stage": StageName::QaAgent }));
            self.store.insert_artifacts(std::slice::from_ref(&artifact)).await?;
            self.events.emit(ProgressEvent::artifact_created(&artifact)).await;
        }
        Ok(())
    }
}

fn reports_failure(output: &Value) -> bool {
    output.get("status").and_then(Value::as_str) == Some("failed")
}

fn detail(output: &Value, fallback: &str) -> String {
    output
        .get("logs")
        .or_else(|| output.get("error"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
