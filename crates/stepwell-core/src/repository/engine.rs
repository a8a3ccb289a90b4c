//! Engine repository trait definition.
//!
//! Defines the storage interface for workflow definitions, runs, attempt
//! memos, and dead letters. The infrastructure layer (stepwell-infra)
//! implements this trait with SQLite persistence; `memory::MemoryRepository`
//! provides an in-process implementation for tests.
//!
//! The claim methods are the engine's only concurrency primitive: each is an
//! atomic compare-and-set on a single run row, so a due run is handed to at
//! most one worker. A claim that returns `None` means another worker won (or
//! the run is no longer in the expected state) and the caller must skip it.

use chrono::{DateTime, Utc};
use stepwell_types::error::RepositoryError;
use stepwell_types::run::{
    AttemptRecord, DeadLetter, ResolutionAction, RunStatus, WorkflowRun,
};
use stepwell_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Repository trait for engine persistence.
///
/// Covers four entity families:
/// - **Definitions:** immutable-per-version workflow graphs.
/// - **Runs:** execution instances with atomic claim transitions.
/// - **Attempts:** the `(run, node, attempt) -> output` idempotency memo.
/// - **Dead letters:** quarantined runs awaiting manual resolution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait EngineRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition version. Fails with `Conflict` if that
    /// `(workflow_id, version)` pair already exists -- published versions
    /// are immutable.
    fn publish_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a specific definition version (the version a run is pinned to).
    fn get_definition(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the latest published version of a workflow.
    fn get_latest_definition(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List the latest version of every workflow, optionally filtered by
    /// workspace.
    fn list_definitions(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Enable or disable a workflow (all versions). Disabled workflows
    /// reject new runs; in-flight runs are unaffected.
    fn set_workflow_enabled(
        &self,
        workflow_id: &Uuid,
        enabled: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record, idempotently.
    ///
    /// If a run with the same idempotency key already exists, the existing
    /// row is returned unchanged and no new row is created (at-most-once run
    /// creation per external event). Callers detect the no-op case by
    /// comparing ids.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<WorkflowRun, RepositoryError>> + Send;

    /// Get a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Persist the full run row.
    ///
    /// Rejects with `InvalidTransition` if the stored row is already in a
    /// terminal status -- `completed`/`failed` admit no further transition.
    fn update_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs, optionally filtered by status, newest first.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Ids of `awaiting_timer` runs whose timer has expired.
    fn list_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Ids of `retrying` runs whose next retry is due.
    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Atomically claim a due timer run: `awaiting_timer` with
    /// `timer_expires_at <= now` becomes `running` with the timer cleared.
    /// Returns the claimed run, or `None` if the claim was lost.
    fn claim_due_timer(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Atomically claim a due retry run: `retrying` with
    /// `next_retry_at <= now` becomes `running` with the retry timestamp
    /// cleared (the retry count is kept).
    fn claim_due_retry(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Atomically claim a run waiting on the given signal type:
    /// `awaiting_signal` with a matching type becomes `running` with the
    /// wait marker cleared. Returns `None` when the run is not waiting for
    /// that signal (the signal is then dropped).
    fn claim_awaiting_signal(
        &self,
        run_id: &Uuid,
        signal_type: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Attempt memo
    // -----------------------------------------------------------------------

    /// Record a completed capability invocation for `(run, node, attempt)`.
    fn record_attempt(
        &self,
        record: &AttemptRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch the memoized result of a completed invocation, if any.
    fn get_attempt(
        &self,
        run_id: &Uuid,
        node_key: &str,
        attempt: u32,
    ) -> impl std::future::Future<Output = Result<Option<AttemptRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    /// Create a dead letter entry. Never updated except through
    /// `resolve_dead_letter`; never deleted.
    fn create_dead_letter(
        &self,
        dead_letter: &DeadLetter,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a dead letter by id.
    fn get_dead_letter(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DeadLetter>, RepositoryError>> + Send;

    /// List unresolved dead letters, oldest first.
    fn list_unresolved_dead_letters(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DeadLetter>, RepositoryError>> + Send;

    /// Attach a resolution to a dead letter. Fails with `Conflict` if it is
    /// already resolved.
    fn resolve_dead_letter(
        &self,
        id: &Uuid,
        action: ResolutionAction,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
