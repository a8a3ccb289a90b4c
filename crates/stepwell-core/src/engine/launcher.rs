//! Trigger ingestion: idempotent run creation, plus operator cancellation.
//!
//! `create_run` is the single entry point for starting a run, whether the
//! trigger was a business event, a manual kick, or the API. A duplicate
//! idempotency key is silently resolved to the existing run -- at-most-once
//! run creation per external event, not an error.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use stepwell_types::error::RepositoryError;
use stepwell_types::event::EngineEvent;
use stepwell_types::run::{Checkpoint, RunStatus, WorkflowRun};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::engine::EngineRepository;

use super::executor::{ExecutorError, StepExecutor, StepOutcome};
use super::graph::estimate_total_steps;

/// Errors from run creation and cancellation.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow {0} is disabled")]
    WorkflowDisabled(Uuid),

    #[error("workflow {0} has no trigger node")]
    NoTriggerNode(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {run_id} is already {status}")]
    AlreadyTerminal { run_id: Uuid, status: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Result of `create_run`: either a freshly started run or the existing
/// one matched by idempotency key.
#[derive(Debug)]
pub struct LaunchResult {
    pub run: WorkflowRun,
    /// False when the idempotency key matched an existing run.
    pub created: bool,
    /// The outcome of driving the run, when it was created here.
    pub outcome: Option<StepOutcome>,
}

/// Creates and cancels runs.
pub struct RunLauncher<R: EngineRepository> {
    repo: Arc<R>,
    executor: Arc<StepExecutor<R>>,
    events: EventBus,
}

impl<R: EngineRepository + 'static> RunLauncher<R> {
    pub fn new(repo: Arc<R>, executor: Arc<StepExecutor<R>>, events: EventBus) -> Self {
        Self {
            repo,
            executor,
            events,
        }
    }

    /// Create a run for the latest enabled version of `workflow_id` and
    /// drive it to its first resting point.
    ///
    /// If a run with the same idempotency key already exists, that run is
    /// returned with `created = false` and nothing is executed.
    pub async fn create_run(
        &self,
        workflow_id: Uuid,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<LaunchResult, LaunchError> {
        let def = self
            .repo
            .get_latest_definition(&workflow_id)
            .await?
            .ok_or(LaunchError::WorkflowNotFound(workflow_id))?;
        if !def.enabled {
            return Err(LaunchError::WorkflowDisabled(workflow_id));
        }
        let trigger = def
            .trigger_node()
            .ok_or(LaunchError::NoTriggerNode(workflow_id))?;

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_name: def.name.clone(),
            definition_version: def.version,
            status: RunStatus::Running,
            current_node_key: Some(trigger.key.clone()),
            step_index: 0,
            total_steps: estimate_total_steps(&def),
            input: payload,
            output: json!({}),
            checkpoint: Checkpoint::default(),
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: None,
            timer_expires_at: None,
            idempotency_key: idempotency_key.to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        let mut stored = self.repo.create_run(&run).await?;
        if stored.id != run.id {
            tracing::debug!(
                idempotency_key,
                existing_run = %stored.id,
                "duplicate trigger resolved to existing run"
            );
            return Ok(LaunchResult {
                run: stored,
                created: false,
                outcome: None,
            });
        }

        self.events.publish(EngineEvent::RunStarted {
            run_id: stored.id,
            workflow_id: stored.workflow_id,
            workflow_name: stored.workflow_name.clone(),
        });
        tracing::info!(
            run_id = %stored.id,
            workflow = stored.workflow_name.as_str(),
            version = stored.definition_version,
            "run started"
        );

        let outcome = self.executor.drive(&mut stored).await?;
        Ok(LaunchResult {
            run: stored,
            created: true,
            outcome: Some(outcome),
        })
    }

    /// Cancel a non-terminal run with a human-supplied reason.
    ///
    /// Explicit cancellation bypasses the dead-letter queue: the run fails
    /// immediately with the reason on record, but nothing is quarantined.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        reason: &str,
        cancelled_by: &str,
    ) -> Result<WorkflowRun, LaunchError> {
        let mut run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(LaunchError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(LaunchError::AlreadyTerminal {
                run_id,
                status: run.status.as_str().to_string(),
            });
        }

        run.status = RunStatus::Failed;
        run.error = Some(format!("cancelled by {cancelled_by}: {reason}"));
        run.completed_at = Some(Utc::now());
        run.timer_expires_at = None;
        run.awaiting_signal = None;
        run.next_retry_at = None;
        self.repo.update_run(&run).await?;

        tracing::info!(
            run_id = %run_id,
            cancelled_by,
            reason,
            "run cancelled"
        );
        self.events.publish(EngineEvent::RunCancelled {
            run_id,
            reason: reason.to_string(),
        });

        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
