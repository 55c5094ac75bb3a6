//! Background execution of runs.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{panic_message, PipelineCoordinator, RunReport};
use crate::config::CraftflowConfig;
use crate::core::{Artifact, PipelineRun, RunStatus, StageExecutionRecord};
use crate::errors::{CraftflowError, Result};
use crate::events::{EventBroadcaster, Subscription};
use crate::persistence::RunStore;
use crate::stages::StageRegistry;

/// A point-in-time view of a run and everything it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// The run.
    pub run: PipelineRun,
    /// Execution records in creation order.
    pub records: Vec<StageExecutionRecord>,
    /// Artifacts in creation order.
    pub artifacts: Vec<Artifact>,
}

/// Starts runs in the background and contains whatever escapes them.
///
/// Each started run gets its own task. The task settles itself: an error
/// or panic moves the run to `failed` before the task ends, whether or not
/// anyone joins it. A finished task drops its own entry from the task
/// table. Progress events go to an [`EventBroadcaster`]; a run's observers
/// are closed when its task ends.
pub struct RunSupervisor {
    coordinator: Arc<PipelineCoordinator>,
    broadcaster: Arc<EventBroadcaster>,
    tasks: Arc<Mutex<HashMap<Uuid, RunTask>>>,
    start_lock: tokio::sync::Mutex<()>,
}

/// A spawned attempt of one run.
struct RunTask {
    attempt: Uuid,
    handle: JoinHandle<Result<RunReport>>,
}

impl std::fmt::Debug for RunSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSupervisor")
            .field("tasks", &self.tasks.lock().len())
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

impl RunSupervisor {
    /// Creates a supervisor that publishes progress through its own
    /// broadcaster.
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: StageRegistry,
        config: CraftflowConfig,
    ) -> Result<Self> {
        let broadcaster = Arc::new(EventBroadcaster::from_config(&config));
        let coordinator = PipelineCoordinator::new(store, broadcaster.clone(), registry, config)?;
        Ok(Self {
            coordinator: Arc::new(coordinator),
            broadcaster,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.coordinator
    }

    /// Returns the broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Persists a new pending run.
    pub async fn create_run(
        &self,
        description: impl Into<String>,
        constraints: Value,
    ) -> Result<PipelineRun> {
        let run = PipelineRun::new(description).with_constraints(constraints);
        self.coordinator.store().create_run(&run).await?;
        info!(run_id = %run.id, "Run created");
        Ok(run)
    }

    /// Subscribes to a run's progress events.
    #[must_use]
    pub fn subscribe_to_run(&self, run_id: Uuid) -> Subscription {
        self.broadcaster.subscribe(run_id)
    }

    /// Starts a pending run in the background and returns immediately.
    pub async fn start_run(&self, run_id: Uuid) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        self.ensure_idle(run_id).await?;

        let run = self.coordinator.load_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(CraftflowError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Analyzing,
            });
        }

        self.spawn(run_id);
        Ok(())
    }

    /// Resets a failed run to `pending` and starts it again.
    ///
    /// Execution records and artifacts of earlier attempts are kept.
    pub async fn retry_run(&self, run_id: Uuid) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        self.ensure_idle(run_id).await?;

        let mut run = self.coordinator.load_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Err(CraftflowError::RunNotRetryable {
                run_id,
                status: run.status,
            });
        }

        run.status = RunStatus::Pending;
        run.failure_reason = None;
        run.completed_at = None;
        run.updated_at = Utc::now();
        self.coordinator.store().update_run(&run).await?;
        info!(%run_id, "Retrying failed run");

        self.spawn(run_id);
        Ok(())
    }

    /// Stops a run's task and fails the run.
    ///
    /// Returns `false` if the run had no task or had already finished.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        let Some(task) = self.tasks.lock().remove(&run_id) else {
            return Ok(false);
        };
        task.handle.abort();
        match task.handle.await {
            Ok(Ok(report)) => {
                info!(%run_id, status = %report.status, "Run finished before cancellation");
            }
            Ok(Err(e)) => {
                warn!(%run_id, error = %e, "Run ended with an error before cancellation");
            }
            Err(e) if e.is_panic() => {
                let panic = panic_message(&*e.into_panic());
                error!(%run_id, %panic, "Run task panicked before cancellation");
            }
            Err(_) => debug!(%run_id, "Run task aborted"),
        }

        let cancelled = self.coordinator.fail_run(run_id, "cancelled").await?;
        self.broadcaster.close_run(run_id);
        if cancelled {
            warn!(%run_id, "Run cancelled");
        }
        Ok(cancelled)
    }

    /// Waits for a run's task and returns its report.
    ///
    /// Returns `None` if the run has no task. A task that already finished
    /// has removed itself; its outcome is in the store.
    pub async fn join(&self, run_id: Uuid) -> Result<Option<RunReport>> {
        let Some(task) = self.tasks.lock().remove(&run_id) else {
            return Ok(None);
        };
        self.collect(run_id, task.handle).await.map(Some)
    }

    /// Returns the runs whose task is still executing.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(run_id, _)| *run_id)
            .collect()
    }

    /// Returns the run with its records and artifacts.
    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunSnapshot> {
        let run = self.coordinator.load_run(run_id).await?;
        let store = self.coordinator.store();
        Ok(RunSnapshot {
            run,
            records: store.list_records(run_id).await?,
            artifacts: store.list_artifacts(run_id).await?,
        })
    }

    /// Waits for every run task to finish. Returns the reports of the runs
    /// that settled without an error.
    pub async fn shutdown(&self) -> Vec<RunReport> {
        let run_ids: Vec<Uuid> = self.tasks.lock().keys().copied().collect();
        info!(count = run_ids.len(), "Waiting for run tasks");
        let mut reports = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            match self.join(run_id).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!(%run_id, error = %e, "Run task failed during shutdown"),
            }
        }
        reports
    }

    /// Fails with `RunAlreadyActive` while a task runs; collects a finished one.
    async fn ensure_idle(&self, run_id: Uuid) -> Result<()> {
        let finished = {
            let mut tasks = self.tasks.lock();
            match tasks.get(&run_id).map(|task| task.handle.is_finished()) {
                Some(false) => return Err(CraftflowError::RunAlreadyActive(run_id)),
                Some(true) => tasks.remove(&run_id),
                None => None,
            }
        };

        if let Some(task) = finished {
            if let Err(e) = self.collect(run_id, task.handle).await {
                warn!(%run_id, error = %e, "Previous attempt ended with an error");
            }
        }
        Ok(())
    }

    fn spawn(&self, run_id: Uuid) {
        let coordinator = self.coordinator.clone();
        let broadcaster = self.broadcaster.clone();
        let tasks = self.tasks.clone();
        let attempt = Uuid::new_v4();

        // Held across the spawn so the task cannot finish before its entry exists.
        let mut table = self.tasks.lock();
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(coordinator.run(run_id))
                .catch_unwind()
                .await;
            let result = settle(&coordinator, run_id, outcome).await;
            broadcaster.close_run(run_id);

            let mut table = tasks.lock();
            if table.get(&run_id).is_some_and(|task| task.attempt == attempt) {
                table.remove(&run_id);
            }
            drop(table);
            result
        });
        table.insert(run_id, RunTask { attempt, handle });
        drop(table);
        info!(%run_id, "Run started");
    }

    /// Awaits a removed task. Only an aborted task, or one that panicked
    /// while settling, still needs the run failed here.
    async fn collect(
        &self,
        run_id: Uuid,
        handle: JoinHandle<Result<RunReport>>,
    ) -> Result<RunReport> {
        let join_error = match handle.await {
            Ok(result) => return result,
            Err(join_error) => join_error,
        };

        let outcome = if join_error.is_panic() {
            Err(join_error.into_panic())
        } else {
            Ok(Err(CraftflowError::Unhandled("Run task was cancelled".into())))
        };
        let result = settle(&self.coordinator, run_id, outcome).await;
        self.broadcaster.close_run(run_id);
        result
    }
}

/// Turns whatever a run task produced into a report, failing the run when
/// the task errored or panicked.
async fn settle(
    coordinator: &PipelineCoordinator,
    run_id: Uuid,
    outcome: std::thread::Result<Result<RunReport>>,
) -> Result<RunReport> {
    let error = match outcome {
        Ok(Ok(report)) => return Ok(report),
        Ok(Err(error)) => error,
        Err(payload) => CraftflowError::Unhandled(format!(
            "Unhandled error: {}",
            panic_message(&*payload)
        )),
    };

    error!(%run_id, error = %error, "Run task ended with an error");
    if let Err(e) = coordinator.fail_run(run_id, &error.to_string()).await {
        error!(%run_id, error = %e, "Could not mark run as failed");
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageName;
    use crate::persistence::InMemoryRunStore;
    use crate::testing::{fixtures, SlowStage};
    use serde_json::json;
    use std::time::Duration;

    fn supervisor(registry: StageRegistry) -> RunSupervisor {
        RunSupervisor::new(
            Arc::new(InMemoryRunStore::new()),
            registry,
            CraftflowConfig::default(),
        )
        .unwrap()
    }

    fn stalled_registry() -> StageRegistry {
        fixtures::scripted_registry().with(Arc::new(SlowStage::new(
            StageName::RequirementInterpreter,
            Duration::from_secs(3600),
            fixtures::output_for(StageName::RequirementInterpreter),
        )))
    }

    #[tokio::test]
    async fn test_start_and_join() {
        let supervisor = supervisor(fixtures::scripted_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        let report = supervisor.join(run.id).await.unwrap().unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(supervisor.join(run.id).await.unwrap().is_none());
        assert!(supervisor.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let supervisor = supervisor(stalled_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        assert!(matches!(
            supervisor.start_run(run.id).await,
            Err(CraftflowError::RunAlreadyActive(id)) if id == run.id
        ));
        assert_eq!(supervisor.active_runs(), vec![run.id]);

        assert!(supervisor.cancel_run(run.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_fails_run_and_sweeps_records() {
        let supervisor = supervisor(stalled_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        while !supervisor
            .coordinator()
            .executor()
            .is_running(run.id, StageName::RequirementInterpreter)
        {
            tokio::task::yield_now().await;
        }

        assert!(supervisor.cancel_run(run.id).await.unwrap());
        assert!(!supervisor.cancel_run(run.id).await.unwrap());

        let snapshot = supervisor.snapshot(run.id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.run.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(
            snapshot.records[0].status,
            crate::core::ExecutionStatus::Failed
        );
        assert_eq!(snapshot.records[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_start_requires_pending_and_retry_requires_failed() {
        let supervisor = supervisor(fixtures::scripted_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        supervisor.join(run.id).await.unwrap();

        assert!(matches!(
            supervisor.start_run(run.id).await,
            Err(CraftflowError::InvalidTransition {
                from: RunStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            supervisor.retry_run(run.id).await,
            Err(CraftflowError::RunNotRetryable {
                status: RunStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            supervisor.start_run(Uuid::new_v4()).await,
            Err(CraftflowError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_run() {
        let supervisor = supervisor(fixtures::scripted_registry());
        let mut run_ids = Vec::new();
        for _ in 0..2 {
            let run = supervisor.create_run("A todo app", json!({})).await.unwrap();
            supervisor.start_run(run.id).await.unwrap();
            run_ids.push(run.id);
        }

        let reports = supervisor.shutdown().await;
        assert!(reports.iter().all(|r| r.status == RunStatus::Completed));
        assert!(supervisor.active_runs().is_empty());
        for run_id in run_ids {
            let snapshot = supervisor.snapshot(run_id).await.unwrap();
            assert_eq!(snapshot.run.status, RunStatus::Completed);
        }
    }

    async fn wait_until_idle(supervisor: &RunSupervisor) {
        while !supervisor.active_runs().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_finished_tasks_leave_the_table() {
        let supervisor = supervisor(fixtures::scripted_registry());
        let mut run_ids = Vec::new();
        for _ in 0..5 {
            let run = supervisor.create_run("A todo app", json!({})).await.unwrap();
            supervisor.start_run(run.id).await.unwrap();
            run_ids.push(run.id);
        }

        wait_until_idle(&supervisor).await;

        assert!(supervisor.tasks.lock().is_empty());
        for run_id in run_ids {
            let snapshot = supervisor.snapshot(run_id).await.unwrap();
            assert_eq!(snapshot.run.status, RunStatus::Completed);
            assert!(supervisor.join(run_id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_status() {
        let supervisor = supervisor(fixtures::scripted_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        wait_until_idle(&supervisor).await;

        assert!(!supervisor.cancel_run(run.id).await.unwrap());
        let snapshot = supervisor.snapshot(run.id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.run.failure_reason, None);
    }

    #[tokio::test]
    async fn test_retry_after_cancel_registers_new_attempt() {
        let supervisor = supervisor(stalled_registry());
        let run = supervisor.create_run("A todo app", json!({})).await.unwrap();

        supervisor.start_run(run.id).await.unwrap();
        assert!(supervisor.cancel_run(run.id).await.unwrap());
        supervisor.retry_run(run.id).await.unwrap();

        assert_eq!(supervisor.active_runs(), vec![run.id]);
        assert!(supervisor.cancel_run(run.id).await.unwrap());
        assert!(supervisor.tasks.lock().is_empty());
    }
}
