//! Dead-letter quarantine, resolution, and replay.
//!
//! Runs that exhaust their retries or hit unrecoverable errors are
//! captured here instead of being lost. A dead letter is created once,
//! mutated only to attach a resolution, and never deleted -- it is the
//! audit trail. Replay never mutates history: `retry` clones a **new** run
//! from the quarantined one, starting at the failing node.

use std::sync::Arc;

use chrono::Utc;
use stepwell_types::error::RepositoryError;
use stepwell_types::event::EngineEvent;
use stepwell_types::run::{
    DeadLetter, ResolutionAction, RunStatus, WorkflowRun,
};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::engine::EngineRepository;

use super::executor::{ExecutorError, StepExecutor, StepOutcome};

// ---------------------------------------------------------------------------
// Quarantine (used by the executor)
// ---------------------------------------------------------------------------

/// Quarantine a run: create its dead letter and fail the run.
///
/// The run transitions to `failed` with wait markers cleared; the dead
/// letter snapshots the input for later replay.
pub async fn quarantine<R: EngineRepository>(
    repo: &R,
    events: &EventBus,
    run: &mut WorkflowRun,
    node_key: &str,
    reason: String,
    can_retry: bool,
) -> Result<DeadLetter, RepositoryError> {
    let dead_letter = DeadLetter {
        id: Uuid::now_v7(),
        run_id: run.id,
        workflow_id: run.workflow_id,
        node_key: node_key.to_string(),
        reason: reason.clone(),
        input: run.input.clone(),
        can_retry,
        created_at: Utc::now(),
        resolved_at: None,
        resolved_by: None,
        resolution_action: None,
        notes: None,
    };
    repo.create_dead_letter(&dead_letter).await?;

    run.status = RunStatus::Failed;
    run.error = Some(reason.clone());
    run.completed_at = Some(Utc::now());
    run.timer_expires_at = None;
    run.awaiting_signal = None;
    run.next_retry_at = None;
    repo.update_run(run).await?;

    tracing::warn!(
        run_id = %run.id,
        node_key,
        can_retry,
        reason = reason.as_str(),
        "run quarantined"
    );

    events.publish(EngineEvent::DeadLetterCreated {
        dead_letter_id: dead_letter.id,
        run_id: run.id,
        node_key: node_key.to_string(),
        can_retry,
    });
    events.publish(EngineEvent::RunFailed {
        run_id: run.id,
        node_key: Some(node_key.to_string()),
        error: reason,
    });

    Ok(dead_letter)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from dead-letter management operations.
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(Uuid),

    #[error("dead letter {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("dead letter {0} is not retryable")]
    NotRetryable(Uuid),

    #[error("original run not found: {0}")]
    RunMissing(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Operator-facing dead-letter operations: inspect, resolve, replay.
pub struct DeadLetterManager<R: EngineRepository> {
    repo: Arc<R>,
    executor: Arc<StepExecutor<R>>,
    events: EventBus,
}

impl<R: EngineRepository + 'static> DeadLetterManager<R> {
    pub fn new(repo: Arc<R>, executor: Arc<StepExecutor<R>>, events: EventBus) -> Self {
        Self {
            repo,
            executor,
            events,
        }
    }

    /// Unresolved dead letters, oldest first.
    pub async fn list_unresolved(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(self.repo.list_unresolved_dead_letters(limit).await?)
    }

    /// Fetch one dead letter.
    pub async fn get(&self, id: Uuid) -> Result<DeadLetter, DeadLetterError> {
        self.repo
            .get_dead_letter(&id)
            .await?
            .ok_or(DeadLetterError::NotFound(id))
    }

    /// Attach a resolution without touching the original run.
    pub async fn resolve(
        &self,
        id: Uuid,
        action: ResolutionAction,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let dead_letter = self.get(id).await?;
        if dead_letter.is_resolved() {
            return Err(DeadLetterError::AlreadyResolved(id));
        }
        self.repo
            .resolve_dead_letter(&id, action, resolved_by, notes)
            .await?;
        tracing::info!(
            dead_letter_id = %id,
            action = action.as_str(),
            resolved_by,
            "dead letter resolved"
        );
        Ok(())
    }

    /// Replay a quarantined run.
    ///
    /// Creates a new run cloned from the original input and checkpoint,
    /// starting at the failing node with a fresh retry budget, then marks
    /// the dead letter resolved with action `retried`. Returns the new
    /// run's outcome.
    pub async fn retry(
        &self,
        id: Uuid,
        resolved_by: &str,
    ) -> Result<(WorkflowRun, StepOutcome), DeadLetterError> {
        let dead_letter = self.get(id).await?;
        if dead_letter.is_resolved() {
            return Err(DeadLetterError::AlreadyResolved(id));
        }
        if !dead_letter.can_retry {
            return Err(DeadLetterError::NotRetryable(id));
        }

        let original = self
            .repo
            .get_run(&dead_letter.run_id)
            .await?
            .ok_or(DeadLetterError::RunMissing(dead_letter.run_id))?;

        let mut replay = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: original.workflow_id,
            workflow_name: original.workflow_name.clone(),
            definition_version: original.definition_version,
            status: RunStatus::Running,
            current_node_key: Some(dead_letter.node_key.clone()),
            step_index: original.step_index,
            total_steps: original.total_steps,
            input: dead_letter.input.clone(),
            output: original.output.clone(),
            checkpoint: original.checkpoint.clone(),
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: None,
            timer_expires_at: None,
            idempotency_key: format!("dlq-retry:{}", dead_letter.id),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        let created = self.repo.create_run(&replay).await?;
        if created.id != replay.id {
            // A replay for this dead letter already exists.
            return Err(DeadLetterError::AlreadyResolved(id));
        }

        self.repo
            .resolve_dead_letter(
                &id,
                ResolutionAction::Retried,
                resolved_by,
                Some(&format!("replayed as run {}", replay.id)),
            )
            .await?;

        self.events.publish(EngineEvent::RunStarted {
            run_id: replay.id,
            workflow_id: replay.workflow_id,
            workflow_name: replay.workflow_name.clone(),
        });

        tracing::info!(
            dead_letter_id = %id,
            original_run = %dead_letter.run_id,
            replay_run = %replay.id,
            node_key = dead_letter.node_key.as_str(),
            "replaying dead letter"
        );

        let outcome = self.executor.drive(&mut replay).await?;
        Ok((replay, outcome))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
