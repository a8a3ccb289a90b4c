//! In-memory engine repository.
//!
//! Backs the engine with plain maps behind a tokio `RwLock`. Used by unit
//! tests and the dry-run simulator; the claim methods hold the write lock
//! for the whole compare-and-set, giving the same at-most-one-winner
//! guarantee as the SQLite conditional updates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepwell_types::error::RepositoryError;
use stepwell_types::run::{
    AttemptRecord, DeadLetter, ResolutionAction, RunStatus, WorkflowRun,
};
use stepwell_types::workflow::WorkflowDefinition;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::engine::EngineRepository;

#[derive(Default)]
struct Tables {
    /// (workflow_id, version) -> definition.
    definitions: HashMap<(Uuid, u32), WorkflowDefinition>,
    runs: HashMap<Uuid, WorkflowRun>,
    /// idempotency_key -> run_id.
    idempotency: HashMap<String, Uuid>,
    /// (run_id, node_key, attempt) -> record.
    attempts: HashMap<(Uuid, String, u32), AttemptRecord>,
    dead_letters: HashMap<Uuid, DeadLetter>,
}

/// In-memory implementation of [`EngineRepository`].
#[derive(Clone, Default)]
pub struct MemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineRepository for MemoryRepository {
    async fn publish_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let key = (def.id, def.version);
        if tables.definitions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} version {} already published",
                def.id, def.version
            )));
        }
        tables.definitions.insert(key, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.definitions.get(&(*workflow_id, version)).cloned())
    }

    async fn get_latest_definition(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .values()
            .filter(|d| d.id == *workflow_id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut latest: HashMap<Uuid, &WorkflowDefinition> = HashMap::new();
        for def in tables.definitions.values() {
            if let Some(ws) = workspace_id {
                if def.workspace_id != *ws {
                    continue;
                }
            }
            match latest.get(&def.id) {
                Some(existing) if existing.version >= def.version => {}
                _ => {
                    latest.insert(def.id, def);
                }
            }
        }
        let mut defs: Vec<WorkflowDefinition> =
            latest.into_values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn set_workflow_enabled(
        &self,
        workflow_id: &Uuid,
        enabled: bool,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let mut found = false;
        for def in tables.definitions.values_mut() {
            if def.id == *workflow_id {
                def.enabled = enabled;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> Result<WorkflowRun, RepositoryError> {
        let mut tables = self.tables.write().await;
        if let Some(existing_id) = tables.idempotency.get(&run.idempotency_key) {
            let existing = tables
                .runs
                .get(existing_id)
                .cloned()
                .ok_or(RepositoryError::NotFound)?;
            return Ok(existing);
        }
        tables
            .idempotency
            .insert(run.idempotency_key.clone(), run.id);
        tables.runs.insert(run.id, run.clone());
        Ok(run.clone())
    }

    async fn get_run(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.runs.get(run_id).cloned())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .runs
            .get(&run.id)
            .ok_or(RepositoryError::NotFound)?;
        if existing.status.is_terminal() {
            return Err(RepositoryError::InvalidTransition(format!(
                "run {} is already {}",
                run.id,
                existing.status.as_str()
            )));
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = tables
            .runs
            .values()
            .filter(|r| r.status == RunStatus::AwaitingTimer)
            .filter_map(|r| {
                r.timer_expires_at
                    .filter(|t| *t <= now)
                    .map(|t| (t, r.id))
            })
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit as usize).map(|(_, id)| id).collect())
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = tables
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Retrying)
            .filter_map(|r| {
                r.next_retry_at.filter(|t| *t <= now).map(|t| (t, r.id))
            })
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit as usize).map(|(_, id)| id).collect())
    }

    async fn claim_due_timer(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(run) = tables.runs.get_mut(run_id) else {
            return Ok(None);
        };
        let due = run.status == RunStatus::AwaitingTimer
            && run.timer_expires_at.is_some_and(|t| t <= now);
        if !due {
            return Ok(None);
        }
        run.status = RunStatus::Running;
        run.timer_expires_at = None;
        Ok(Some(run.clone()))
    }

    async fn claim_due_retry(
        &self,
        run_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(run) = tables.runs.get_mut(run_id) else {
            return Ok(None);
        };
        let due = run.status == RunStatus::Retrying
            && run.next_retry_at.is_some_and(|t| t <= now);
        if !due {
            return Ok(None);
        }
        run.status = RunStatus::Running;
        run.next_retry_at = None;
        Ok(Some(run.clone()))
    }

    async fn claim_awaiting_signal(
        &self,
        run_id: &Uuid,
        signal_type: &str,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(run) = tables.runs.get_mut(run_id) else {
            return Ok(None);
        };
        let waiting = run.status == RunStatus::AwaitingSignal
            && run.awaiting_signal.as_deref() == Some(signal_type);
        if !waiting {
            return Ok(None);
        }
        run.status = RunStatus::Running;
        run.awaiting_signal = None;
        Ok(Some(run.clone()))
    }

    async fn record_attempt(
        &self,
        record: &AttemptRecord,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.attempts.insert(
            (record.run_id, record.node_key.clone(), record.attempt),
            record.clone(),
        );
        Ok(())
    }

    async fn get_attempt(
        &self,
        run_id: &Uuid,
        node_key: &str,
        attempt: u32,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .get(&(*run_id, node_key.to_string(), attempt))
            .cloned())
    }

    async fn create_dead_letter(
        &self,
        dead_letter: &DeadLetter,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.dead_letters.insert(dead_letter.id, dead_letter.clone());
        Ok(())
    }

    async fn get_dead_letter(
        &self,
        id: &Uuid,
    ) -> Result<Option<DeadLetter>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.dead_letters.get(id).cloned())
    }

    async fn list_unresolved_dead_letters(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut letters: Vec<DeadLetter> = tables
            .dead_letters
            .values()
            .filter(|dl| !dl.is_resolved())
            .cloned()
            .collect();
        letters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        letters.truncate(limit as usize);
        Ok(letters)
    }

    async fn resolve_dead_letter(
        &self,
        id: &Uuid,
        action: ResolutionAction,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let dl = tables
            .dead_letters
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        if dl.is_resolved() {
            return Err(RepositoryError::Conflict(format!(
                "dead letter {id} is already resolved"
            )));
        }
        dl.resolved_at = Some(Utc::now());
        dl.resolved_by = Some(resolved_by.to_string());
        dl.resolution_action = Some(action);
        dl.notes = notes.map(String::from);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwell_types::run::Checkpoint;
    use stepwell_types::workflow::{
        NodeConfig, NodeDefinition, SafetyLevel, TriggerKind,
    };

    fn sample_definition(version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "test-wf".to_string(),
            description: None,
            version,
            trigger: TriggerKind::Manual {},
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

    fn sample_run(idempotency_key: &str, status: RunStatus) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "test-wf".to_string(),
            definition_version: 1,
            status,
            current_node_key: Some("start".to_string()),
            step_index: 0,
            total_steps: 1,
            input: json!({}),
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
        }
    }

    #[tokio::test]
    async fn publish_same_version_twice_conflicts() {
        let repo = MemoryRepository::new();
        let def = sample_definition(1);
        repo.publish_definition(&def).await.unwrap();
        let err = repo.publish_definition(&def).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn latest_definition_picks_highest_version() {
        let repo = MemoryRepository::new();
        let mut def = sample_definition(1);
        repo.publish_definition(&def).await.unwrap();
        def.version = 2;
        repo.publish_definition(&def).await.unwrap();

        let latest = repo.get_latest_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        // The pinned version is still retrievable.
        let pinned = repo.get_definition(&def.id, 1).await.unwrap().unwrap();
        assert_eq!(pinned.version, 1);
    }

    #[tokio::test]
    async fn create_run_is_idempotent_by_key() {
        let repo = MemoryRepository::new();
        let first = sample_run("evt-1", RunStatus::Running);
        let created = repo.create_run(&first).await.unwrap();
        assert_eq!(created.id, first.id);

        let second = sample_run("evt-1", RunStatus::Running);
        let resolved = repo.create_run(&second).await.unwrap();
        assert_eq!(resolved.id, first.id, "duplicate key returns the first run");

        let all = repo.list_runs(None, 10).await.unwrap();
        assert_eq!(all.len(), 1, "no second row created");
    }

    #[tokio::test]
    async fn terminal_runs_reject_updates() {
        let repo = MemoryRepository::new();
        let mut run = sample_run("evt-2", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        repo.update_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        let err = repo.update_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn claim_due_timer_single_winner() {
        let repo = MemoryRepository::new();
        let mut run = sample_run("evt-3", RunStatus::AwaitingTimer);
        run.timer_expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        repo.create_run(&run).await.unwrap();

        let now = Utc::now();
        let first = repo.claim_due_timer(&run.id, now).await.unwrap();
        assert!(first.is_some(), "first claim wins");
        let second = repo.claim_due_timer(&run.id, now).await.unwrap();
        assert!(second.is_none(), "second claim loses");

        let claimed = first.unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.timer_expires_at.is_none());
    }

    #[tokio::test]
    async fn claim_due_timer_not_due_is_noop() {
        let repo = MemoryRepository::new();
        let mut run = sample_run("evt-4", RunStatus::AwaitingTimer);
        run.timer_expires_at = Some(Utc::now() + chrono::Duration::hours(24));
        repo.create_run(&run).await.unwrap();

        let claimed = repo.claim_due_timer(&run.id, Utc::now()).await.unwrap();
        assert!(claimed.is_none());
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::AwaitingTimer);
    }

    #[tokio::test]
    async fn concurrent_claims_only_one_succeeds() {
        let repo = MemoryRepository::new();
        let mut run = sample_run("evt-5", RunStatus::Retrying);
        run.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(5));
        repo.create_run(&run).await.unwrap();

        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let id = run.id;
            handles.push(tokio::spawn(async move {
                repo.claim_due_retry(&id, now).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent claim may win");
    }

    #[tokio::test]
    async fn claim_awaiting_signal_requires_matching_type() {
        let repo = MemoryRepository::new();
        let mut run = sample_run("evt-6", RunStatus::AwaitingSignal);
        run.awaiting_signal = Some("reply_received".to_string());
        repo.create_run(&run).await.unwrap();

        let miss = repo
            .claim_awaiting_signal(&run.id, "deposit_paid")
            .await
            .unwrap();
        assert!(miss.is_none(), "wrong signal type does not claim");

        let hit = repo
            .claim_awaiting_signal(&run.id, "reply_received")
            .await
            .unwrap();
        let claimed = hit.unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.awaiting_signal.is_none());
    }

    #[tokio::test]
    async fn attempt_memo_roundtrip() {
        let repo = MemoryRepository::new();
        let run_id = Uuid::now_v7();
        let record = AttemptRecord {
            run_id,
            node_key: "send-dm".to_string(),
            attempt: 0,
            output: json!({"message_id": "m1"}),
            completed_at: Utc::now(),
        };
        repo.record_attempt(&record).await.unwrap();

        let found = repo.get_attempt(&run_id, "send-dm", 0).await.unwrap();
        assert_eq!(found.unwrap().output, json!({"message_id": "m1"}));
        let missing = repo.get_attempt(&run_id, "send-dm", 1).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn dead_letter_resolve_only_once() {
        let repo = MemoryRepository::new();
        let dl = DeadLetter {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            node_key: "send-dm".to_string(),
            reason: "capability timed out".to_string(),
            input: json!({}),
            can_retry: true,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_action: None,
            notes: None,
        };
        repo.create_dead_letter(&dl).await.unwrap();
        assert_eq!(repo.list_unresolved_dead_letters(10).await.unwrap().len(), 1);

        repo.resolve_dead_letter(&dl.id, ResolutionAction::Dismissed, "ops", None)
            .await
            .unwrap();
        assert!(repo.list_unresolved_dead_letters(10).await.unwrap().is_empty());

        let err = repo
            .resolve_dead_letter(&dl.id, ResolutionAction::Retried, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }
}
