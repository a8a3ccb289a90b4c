//! SQLite engine repository implementation.
//!
//! Implements `EngineRepository` from `stepwell-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs keyed by
//! `(workflow_id, version)`; runs use typed columns so the scheduler's due
//! scans and claim updates can filter in SQL. All claims are conditional
//! UPDATEs -- `rows_affected == 1` means this worker won.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepwell_core::repository::engine::EngineRepository;
use stepwell_types::error::RepositoryError;
use stepwell_types::run::{
    AttemptRecord, Checkpoint, DeadLetter, ResolutionAction, RunStatus, WorkflowRun,
};
use stepwell_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `EngineRepository`.
pub struct SqliteEngineRepository {
    pool: DatabasePool,
}

impl SqliteEngineRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))
    }
}

struct RunRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    definition_version: i64,
    status: String,
    current_node_key: Option<String>,
    step_index: i64,
    total_steps: i64,
    input: String,
    output: String,
    checkpoint: String,
    retry_count: i64,
    next_retry_at: Option<String>,
    awaiting_signal: Option<String>,
    timer_expires_at: Option<String>,
    idempotency_key: String,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            current_node_key: row.try_get("current_node_key")?,
            step_index: row.try_get("step_index")?,
            total_steps: row.try_get("total_steps")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            checkpoint: row.try_get("checkpoint")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            awaiting_signal: row.try_get("awaiting_signal")?,
            timer_expires_at: row.try_get("timer_expires_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;

        let input: serde_json::Value = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;
        let output: serde_json::Value = serde_json::from_str(&self.output)
            .map_err(|e| RepositoryError::Query(format!("invalid output JSON: {e}")))?;
        let checkpoint: Checkpoint = serde_json::from_str(&self.checkpoint)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint JSON: {e}")))?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            definition_version: self.definition_version as u32,
            status,
            current_node_key: self.current_node_key,
            step_index: self.step_index as u32,
            total_steps: self.total_steps as u32,
            input,
            output,
            checkpoint,
            retry_count: self.retry_count as u32,
            next_retry_at: self.next_retry_at.as_deref().map(parse_datetime).transpose()?,
            awaiting_signal: self.awaiting_signal,
            timer_expires_at: self
                .timer_expires_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            idempotency_key: self.idempotency_key,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct DeadLetterRow {
    id: String,
    run_id: String,
    workflow_id: String,
    node_key: String,
    reason: String,
    input: String,
    can_retry: i64,
    created_at: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution_action: Option<String>,
    notes: Option<String>,
}

impl DeadLetterRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            node_key: row.try_get("node_key")?,
            reason: row.try_get("reason")?,
            input: row.try_get("input")?,
            can_retry: row.try_get("can_retry")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution_action: row.try_get("resolution_action")?,
            notes: row.try_get("notes")?,
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter, RepositoryError> {
        let resolution_action = self
            .resolution_action
            .as_deref()
            .map(|s| {
                ResolutionAction::parse(s).ok_or_else(|| {
                    RepositoryError::Query(format!("invalid resolution action: {s}"))
                })
            })
            .transpose()?;

        let input: serde_json::Value = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;

        Ok(DeadLetter {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            node_key: self.node_key,
            reason: self.reason,
            input,
            can_retry: self.can_retry != 0,
            created_at: parse_datetime(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
            resolved_by: self.resolved_by,
            resolution_action,
            notes: self.notes,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC3339 (millisecond, Z-suffixed) so lexicographic string
/// comparison in SQL matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn run_bindings(run: &WorkflowRun) -> Result<RunRow, RepositoryError> {
    Ok(RunRow {
        id: run.id.to_string(),
        workflow_id: run.workflow_id.to_string(),
        workflow_name: run.workflow_name.clone(),
        definition_version: i64::from(run.definition_version),
        status: run.status.as_str().to_string(),
        current_node_key: run.current_node_key.clone(),
        step_index: i64::from(run.step_index),
        total_steps: i64::from(run.total_steps),
        input: serde_json::to_string(&run.input)
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        output: serde_json::to_string(&run.output)
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        checkpoint: serde_json::to_string(&run.checkpoint)
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        retry_count: i64::from(run.retry_count),
        next_retry_at: run.next_retry_at.as_ref().map(format_datetime),
        awaiting_signal: run.awaiting_signal.clone(),
        timer_expires_at: run.timer_expires_at.as_ref().map(format_datetime),
        idempotency_key: run.idempotency_key.clone(),
        error: run.error.clone(),
        started_at: format_datetime(&run.started_at),
        completed_at: run.completed_at.as_ref().map(format_datetime),
    })
}

// ---------------------------------------------------------------------------
// EngineRepository impl
// ---------------------------------------------------------------------------

impl EngineRepository for SqliteEngineRepository {
    async fn publish_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO workflow_versions
               (workflow_id, version, workspace_id, name, enabled, definition, published_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(i64::from(def.version))
        .bind(def.workspace_id.to_string())
        .bind(&def.name)
        .bind(i64::from(def.enabled))
        .bind(&definition_json)
        .bind(format_datetime(&def.published_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} version {} already published",
                def.id, def.version
            )));
        }
        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_versions WHERE workflow_id = ? AND version = ?",
        )
        .bind(workflow_id.to_string())
        .bind(i64::from(version))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            DefinitionRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_definition()
        })
        .transpose()
    }

    async fn get_latest_definition(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_versions WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            DefinitionRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_definition()
        })
        .transpose()
    }

    async fn list_definitions(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        // Latest version per workflow, optionally scoped to a workspace.
        let rows = match workspace_id {
            Some(ws) => {
                sqlx::query(
                    r#"SELECT definition FROM workflow_versions v
                       WHERE workspace_id = ?
                         AND version = (SELECT MAX(version) FROM workflow_versions
                                        WHERE workflow_id = v.workflow_id)
                       ORDER BY name ASC"#,
                )
                .bind(ws.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT definition FROM workflow_versions v
                       WHERE version = (SELECT MAX(version) FROM workflow_versions
                                        WHERE workflow_id = v.workflow_id)
                       ORDER BY name ASC"#,
                )
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn set_workflow_enabled(
        &self,
        workflow_id: &Uuid,
        enabled: bool,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_versions
               SET enabled = ?,
                   definition = json_set(definition, '$.enabled', json(?))
               WHERE workflow_id = ?"#,
        )
        .bind(i64::from(enabled))
        .bind(if enabled { "true" } else { "false" })
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<WorkflowRun, RepositoryError> {
        let r = run_bindings(run)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, workflow_name, definition_version, status,
                current_node_key, step_index, total_steps, input, output, checkpoint,
                retry_count, next_retry_at, awaiting_signal, timer_expires_at,
                idempotency_key, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(idempotency_key) DO NOTHING"#,
        )
        .bind(&r.id)
        .bind(&r.workflow_id)
        .bind(&r.workflow_name)
        .bind(r.definition_version)
        .bind(&r.status)
        .bind(&r.current_node_key)
        .bind(r.step_index)
        .bind(r.total_steps)
        .bind(&r.input)
        .bind(&r.output)
        .bind(&r.checkpoint)
        .bind(r.retry_count)
        .bind(&r.next_retry_at)
        .bind(&r.awaiting_signal)
        .bind(&r.timer_expires_at)
        .bind(&r.idempotency_key)
        .bind(&r.error)
        .bind(&r.started_at)
        .bind(&r.completed_at)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(run.clone());
        }

        // Idempotency key conflict: return the existing run unchanged.
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE idempotency_key = ?")
            .bind(&r.idempotency_key)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        RunRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_run()
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            RunRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_run()
        })
        .transpose()
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let r = run_bindings(run)?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?, current_node_key = ?, step_index = ?, total_steps = ?,
                 output = ?, checkpoint = ?, retry_count = ?, next_retry_at = ?,
                 awaiting_signal = ?, timer_expires_at = ?, error = ?, completed_at = ?
               WHERE id = ? AND status NOT IN ('completed', 'failed')"#,
        )
        .bind(&r.status)
        .bind(&r.current_node_key)
        .bind(r.step_index)
        .bind(r.total_steps)
        .bind(&r.output)
        .bind(&r.checkpoint)
        .bind(r.retry_count)
        .bind(&r.next_retry_at)
        .bind(&r.awaiting_signal)
        .bind(&r.timer_expires_at)
        .bind(&r.error)
        .bind(&r.completed_at)
        .bind(&r.id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish a terminal row from a missing one.
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT status FROM workflow_runs WHERE id = ?")
                    .bind(&r.id)
                    .fetch_optional(&self.pool.writer)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return match exists {
                Some((status,)) => Err(RepositoryError::InvalidTransition(format!(
                    "run {} is already {status}",
                    run.id
                ))),
                None => Err(RepositoryError::NotFound),
            };
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE status = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(s.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs ORDER BY started_at DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn list_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM workflow_runs
               WHERE status = 'awaiting_timer' AND timer_expires_at <= ?
               ORDER BY timer_expires_at ASC LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM workflow_runs
               WHERE status = 'retrying' AND next_retry_at <= ?
               ORDER BY next_retry_at ASC LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    async fn claim_due_timer(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = 'running', timer_expires_at = NULL
               WHERE id = ? AND status = 'awaiting_timer' AND timer_expires_at <= ?"#,
        )
        .bind(run_id.to_string())
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_run(run_id).await
    }

    async fn claim_due_retry(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = 'running', next_retry_at = NULL
               WHERE id = ? AND status = 'retrying' AND next_retry_at <= ?"#,
        )
        .bind(run_id.to_string())
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_run(run_id).await
    }

    async fn claim_awaiting_signal(
        &self,
        run_id: &Uuid,
        signal_type: &str,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = 'running', awaiting_signal = NULL
               WHERE id = ? AND status = 'awaiting_signal' AND awaiting_signal = ?"#,
        )
        .bind(run_id.to_string())
        .bind(signal_type)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_run(run_id).await
    }

    async fn record_attempt(&self, record: &AttemptRecord) -> Result<(), RepositoryError> {
        let output = serde_json::to_string(&record.output)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO run_attempts
               (run_id, node_key, attempt, output, completed_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.node_key)
        .bind(i64::from(record.attempt))
        .bind(&output)
        .bind(format_datetime(&record.completed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_attempt(
        &self,
        run_id: &Uuid,
        node_key: &str,
        attempt: u32,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT output, completed_at FROM run_attempts
               WHERE run_id = ? AND node_key = ? AND attempt = ?"#,
        )
        .bind(run_id.to_string())
        .bind(node_key)
        .bind(i64::from(attempt))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|(output, completed_at)| {
            Ok(AttemptRecord {
                run_id: *run_id,
                node_key: node_key.to_string(),
                attempt,
                output: serde_json::from_str(&output)
                    .map_err(|e| RepositoryError::Query(format!("invalid attempt output: {e}")))?,
                completed_at: parse_datetime(&completed_at)?,
            })
        })
        .transpose()
    }

    async fn create_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), RepositoryError> {
        let input = serde_json::to_string(&dead_letter.input)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO dead_letters
               (id, run_id, workflow_id, node_key, reason, input, can_retry,
                created_at, resolved_at, resolved_by, resolution_action, notes)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(dead_letter.id.to_string())
        .bind(dead_letter.run_id.to_string())
        .bind(dead_letter.workflow_id.to_string())
        .bind(&dead_letter.node_key)
        .bind(&dead_letter.reason)
        .bind(&input)
        .bind(i64::from(dead_letter.can_retry))
        .bind(format_datetime(&dead_letter.created_at))
        .bind(dead_letter.resolved_at.as_ref().map(format_datetime))
        .bind(&dead_letter.resolved_by)
        .bind(dead_letter.resolution_action.map(|a| a.as_str()))
        .bind(&dead_letter.notes)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_dead_letter(&self, id: &Uuid) -> Result<Option<DeadLetter>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| {
            DeadLetterRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_dead_letter()
        })
        .transpose()
    }

    async fn list_unresolved_dead_letters(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letters WHERE resolved_at IS NULL ORDER BY created_at ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut letters = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DeadLetterRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            letters.push(r.into_dead_letter()?);
        }
        Ok(letters)
    }

    async fn resolve_dead_letter(
        &self,
        id: &Uuid,
        action: ResolutionAction,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE dead_letters
               SET resolved_at = ?, resolved_by = ?, resolution_action = ?, notes = ?
               WHERE id = ? AND resolved_at IS NULL"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(resolved_by)
        .bind(action.as_str())
        .bind(notes)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM dead_letters WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool.writer)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return match exists {
                Some(_) => Err(RepositoryError::Conflict(format!(
                    "dead letter {id} is already resolved"
                ))),
                None => Err(RepositoryError::NotFound),
            };
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use stepwell_types::workflow::{
        NodeConfig, NodeDefinition, SafetyLevel, TriggerKind,
    };

    async fn repo() -> (tempfile::TempDir, SqliteEngineRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("engine.db").display()
        );
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteEngineRepository::new(pool))
    }

    fn sample_definition(version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "welcome".to_string(),
            description: Some("greets new leads".to_string()),
            version,
            trigger: TriggerKind::Event {
                name: "message_received".to_string(),
            },
            safety_level: SafetyLevel::Autopilot,
            enabled: true,
            nodes: vec![NodeDefinition {
                key: "start".to_string(),
                name: "Start".to_string(),
                config: NodeConfig::Trigger { next: None },
            }],
            published_at: Utc::now(),
        }
    }

    fn sample_run(workflow_id: Uuid, key: &str, status: RunStatus) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_name: "welcome".to_string(),
            definition_version: 1,
            status,
            current_node_key: Some("start".to_string()),
            step_index: 0,
            total_steps: 1,
            input: json!({"lead_id": "abc"}),
            output: json!({}),
            checkpoint: Checkpoint::default(),
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: None,
            timer_expires_at: None,
            idempotency_key: key.to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn definition_publish_and_versioning() {
        let (_dir, repo) = repo().await;
        let mut def = sample_definition(1);
        repo.publish_definition(&def).await.unwrap();

        // Re-publishing the same version conflicts.
        let err = repo.publish_definition(&def).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        def.version = 2;
        def.description = Some("v2".to_string());
        repo.publish_definition(&def).await.unwrap();

        let latest = repo.get_latest_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        let pinned = repo.get_definition(&def.id, 1).await.unwrap().unwrap();
        assert_eq!(pinned.version, 1);

        let listed = repo.list_definitions(None).await.unwrap();
        assert_eq!(listed.len(), 1, "one workflow, latest version only");
        assert_eq!(listed[0].version, 2);
    }

    #[tokio::test]
    async fn set_enabled_flips_all_versions() {
        let (_dir, repo) = repo().await;
        let mut def = sample_definition(1);
        repo.publish_definition(&def).await.unwrap();
        def.version = 2;
        repo.publish_definition(&def).await.unwrap();

        repo.set_workflow_enabled(&def.id, false).await.unwrap();
        let latest = repo.get_latest_definition(&def.id).await.unwrap().unwrap();
        assert!(!latest.enabled);

        let err = repo
            .set_workflow_enabled(&Uuid::now_v7(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn run_roundtrip_preserves_fields() {
        let (_dir, repo) = repo().await;
        let mut run = sample_run(Uuid::now_v7(), "evt-1", RunStatus::AwaitingTimer);
        run.timer_expires_at = Some(Utc::now() + Duration::hours(24));
        run.checkpoint.vars.insert("score".to_string(), json!(9));
        repo.create_run(&run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::AwaitingTimer);
        assert_eq!(stored.input, json!({"lead_id": "abc"}));
        assert_eq!(stored.checkpoint.vars["score"], json!(9));
        assert!(stored.timer_expires_at.is_some());
    }

    #[tokio::test]
    async fn create_run_idempotent_by_key() {
        let (_dir, repo) = repo().await;
        let workflow_id = Uuid::now_v7();
        let first = sample_run(workflow_id, "evt-dup", RunStatus::Running);
        let created = repo.create_run(&first).await.unwrap();
        assert_eq!(created.id, first.id);

        let second = sample_run(workflow_id, "evt-dup", RunStatus::Running);
        let resolved = repo.create_run(&second).await.unwrap();
        assert_eq!(resolved.id, first.id, "duplicate resolves to existing run");

        assert_eq!(repo.list_runs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_status_is_enforced_by_update() {
        let (_dir, repo) = repo().await;
        let mut run = sample_run(Uuid::now_v7(), "evt-2", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        repo.update_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        let err = repo.update_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn due_timer_listing_and_claim() {
        let (_dir, repo) = repo().await;
        let mut due = sample_run(Uuid::now_v7(), "evt-3", RunStatus::AwaitingTimer);
        due.timer_expires_at = Some(Utc::now() - Duration::minutes(5));
        repo.create_run(&due).await.unwrap();

        let mut not_due = sample_run(Uuid::now_v7(), "evt-4", RunStatus::AwaitingTimer);
        not_due.timer_expires_at = Some(Utc::now() + Duration::hours(1));
        repo.create_run(&not_due).await.unwrap();

        let now = Utc::now();
        let ids = repo.list_due_timers(now, 10).await.unwrap();
        assert_eq!(ids, vec![due.id]);

        let claimed = repo.claim_due_timer(&due.id, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.timer_expires_at.is_none());

        // Second claim loses.
        assert!(repo.claim_due_timer(&due.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_retry_claim_keeps_retry_count() {
        let (_dir, repo) = repo().await;
        let mut run = sample_run(Uuid::now_v7(), "evt-5", RunStatus::Retrying);
        run.retry_count = 2;
        run.next_retry_at = Some(Utc::now() - Duration::seconds(10));
        repo.create_run(&run).await.unwrap();

        let claimed = repo
            .claim_due_retry(&run.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert_eq!(claimed.retry_count, 2);
        assert!(claimed.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn signal_claim_requires_matching_type() {
        let (_dir, repo) = repo().await;
        let mut run = sample_run(Uuid::now_v7(), "evt-6", RunStatus::AwaitingSignal);
        run.awaiting_signal = Some("reply_received".to_string());
        repo.create_run(&run).await.unwrap();

        assert!(repo
            .claim_awaiting_signal(&run.id, "deposit_paid")
            .await
            .unwrap()
            .is_none());

        let claimed = repo
            .claim_awaiting_signal(&run.id, "reply_received")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.awaiting_signal.is_none());
    }

    #[tokio::test]
    async fn attempt_memo_roundtrip() {
        let (_dir, repo) = repo().await;
        let run_id = Uuid::now_v7();
        let record = AttemptRecord {
            run_id,
            node_key: "send".to_string(),
            attempt: 1,
            output: json!({"message_id": "m7"}),
            completed_at: Utc::now(),
        };
        repo.record_attempt(&record).await.unwrap();

        let found = repo.get_attempt(&run_id, "send", 1).await.unwrap().unwrap();
        assert_eq!(found.output, json!({"message_id": "m7"}));
        assert!(repo.get_attempt(&run_id, "send", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_lifecycle() {
        let (_dir, repo) = repo().await;
        let dl = DeadLetter {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            node_key: "send".to_string(),
            reason: "retries exhausted after 3 attempts: upstream 503".to_string(),
            input: json!({"lead_id": "abc"}),
            can_retry: true,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_action: None,
            notes: None,
        };
        repo.create_dead_letter(&dl).await.unwrap();

        let unresolved = repo.list_unresolved_dead_letters(10).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert!(unresolved[0].can_retry);

        repo.resolve_dead_letter(&dl.id, ResolutionAction::Retried, "ops", Some("replayed"))
            .await
            .unwrap();
        assert!(repo.list_unresolved_dead_letters(10).await.unwrap().is_empty());

        let stored = repo.get_dead_letter(&dl.id).await.unwrap().unwrap();
        assert_eq!(stored.resolution_action, Some(ResolutionAction::Retried));
        assert_eq!(stored.notes.as_deref(), Some("replayed"));

        let err = repo
            .resolve_dead_letter(&dl.id, ResolutionAction::Dismissed, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }
}
