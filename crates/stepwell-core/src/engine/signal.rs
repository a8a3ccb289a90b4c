//! Signal router: delivers external signals to runs parked in
//! `awaiting_signal`.
//!
//! Signals are fire-and-forget. A signal for a run that is not currently
//! waiting for that type is dropped with a log line, never queued -- a run
//! only begins waiting once it reaches the waiting node, so queuing would
//! deliver stale events.

use std::sync::Arc;

use serde_json::Value;
use stepwell_types::error::RepositoryError;
use stepwell_types::event::EngineEvent;
use stepwell_types::run::Signal;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::engine::EngineRepository;

use super::executor::{ExecutorError, StepExecutor, StepOutcome};

/// Errors from signal delivery.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// What happened to a delivered signal.
#[derive(Debug)]
pub enum SignalOutcome {
    /// The signal matched a waiting run; the run progressed to `outcome`.
    Delivered { outcome: StepOutcome },
    /// No matching wait state -- the signal was dropped (logged, not an
    /// error).
    Ignored,
}

/// Routes inbound signals to waiting runs.
pub struct SignalRouter<R: EngineRepository> {
    repo: Arc<R>,
    executor: Arc<StepExecutor<R>>,
    events: EventBus,
}

impl<R: EngineRepository + 'static> SignalRouter<R> {
    pub fn new(repo: Arc<R>, executor: Arc<StepExecutor<R>>, events: EventBus) -> Self {
        Self {
            repo,
            executor,
            events,
        }
    }

    /// Deliver a signal to a run.
    ///
    /// Atomically claims the wait state; on a match the payload is merged
    /// into `checkpoint.signals[signal_type]` and the run is handed to the
    /// executor. The call succeeds either way -- callers inspect the
    /// outcome.
    pub async fn deliver(
        &self,
        run_id: Uuid,
        signal_type: &str,
        payload: Value,
    ) -> Result<SignalOutcome, SignalError> {
        let signal = Signal::new(run_id, signal_type, payload);

        let Some(mut run) = self
            .repo
            .claim_awaiting_signal(&run_id, signal_type)
            .await?
        else {
            tracing::info!(
                run_id = %run_id,
                signal_type,
                "signal ignored: run not awaiting this signal"
            );
            self.events.publish(EngineEvent::SignalIgnored {
                run_id,
                signal_type: signal_type.to_string(),
            });
            return Ok(SignalOutcome::Ignored);
        };

        run.checkpoint
            .signals
            .insert(signal.signal_type.clone(), signal.payload.clone());
        self.repo.update_run(&run).await?;

        self.events.publish(EngineEvent::SignalDelivered {
            run_id,
            signal_type: signal_type.to_string(),
        });
        tracing::debug!(run_id = %run_id, signal_type, "signal delivered");

        let outcome = self.executor.resume(&mut run).await?;
        Ok(SignalOutcome::Delivered { outcome })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stepwell_types::run::{Checkpoint, RunStatus, WorkflowRun};
    use stepwell_types::workflow::{
        NodeConfig, NodeDefinition, SafetyLevel, TriggerKind, WorkflowDefinition,
    };

    use crate::engine::capability::{CapabilityRegistry, NoopCapability};
    use crate::engine::executor::ExecutorConfig;
    use crate::engine::safety::SafetyGate;
    use crate::repository::memory::MemoryRepository;

    fn waiting_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "wait-for-reply".to_string(),
            description: None,
            version: 1,
            trigger: TriggerKind::Manual {},
            safety_level: SafetyLevel::Autopilot,
            enabled: true,
            nodes: vec![
                NodeDefinition {
                    key: "start".to_string(),
                    name: "Start".to_string(),
                    config: NodeConfig::Trigger {
                        next: Some("ask".to_string()),
                    },
                },
                NodeDefinition {
                    key: "ask".to_string(),
                    name: "Ask".to_string(),
                    config: NodeConfig::Action {
                        capability: "noop".to_string(),
                        params: json!({}),
                        await_signal: Some("reply_received".to_string()),
                        next: Some("confirm".to_string()),
                    },
                },
                NodeDefinition {
                    key: "confirm".to_string(),
                    name: "Confirm".to_string(),
                    config: NodeConfig::Action {
                        capability: "noop".to_string(),
                        params: json!({}),
                        await_signal: None,
                        next: None,
                    },
                },
            ],
            published_at: Utc::now(),
        }
    }

    async fn router_for(
        def: &WorkflowDefinition,
    ) -> (Arc<MemoryRepository>, SignalRouter<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        repo.publish_definition(def).await.unwrap();
        let registry = CapabilityRegistry::new();
        registry.register(Arc::new(NoopCapability::new("noop")));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&repo),
            registry,
            SafetyGate::new(),
            EventBus::new(64),
            ExecutorConfig::default(),
        ));
        let router = SignalRouter::new(Arc::clone(&repo), executor, EventBus::new(64));
        (repo, router)
    }

    fn waiting_run(def: &WorkflowDefinition) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_name: def.name.clone(),
            definition_version: 1,
            status: RunStatus::AwaitingSignal,
            current_node_key: Some("ask".to_string()),
            step_index: 2,
            total_steps: 3,
            input: json!({}),
            output: json!({"ask": {"noop": true}}),
            checkpoint: Checkpoint::default(),
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: Some("reply_received".to_string()),
            timer_expires_at: None,
            idempotency_key: Uuid::now_v7().to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn matching_signal_resumes_run() {
        let def = waiting_definition();
        let (repo, router) = router_for(&def).await;
        let run = waiting_run(&def);
        repo.create_run(&run).await.unwrap();

        let outcome = router
            .deliver(run.id, "reply_received", json!({"text": "yes please"}))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            SignalOutcome::Delivered {
                outcome: StepOutcome::Completed
            }
        ));
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(
            stored.checkpoint.signals["reply_received"]["text"],
            json!("yes please"),
            "payload merged into checkpoint"
        );
        assert!(stored.output.get("confirm").is_some());
    }

    #[tokio::test]
    async fn wrong_signal_type_is_ignored_noop() {
        let def = waiting_definition();
        let (repo, router) = router_for(&def).await;
        let run = waiting_run(&def);
        repo.create_run(&run).await.unwrap();

        let outcome = router
            .deliver(run.id, "deposit_paid", json!({}))
            .await
            .unwrap();

        assert!(matches!(outcome, SignalOutcome::Ignored));
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::AwaitingSignal, "state unchanged");
        assert!(stored.checkpoint.signals.is_empty());
    }

    #[tokio::test]
    async fn signal_for_unknown_run_is_ignored() {
        let def = waiting_definition();
        let (_repo, router) = router_for(&def).await;

        let outcome = router
            .deliver(Uuid::now_v7(), "reply_received", json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Ignored));
    }

    #[tokio::test]
    async fn signal_is_consumed_at_most_once() {
        let def = waiting_definition();
        let (repo, router) = router_for(&def).await;
        let run = waiting_run(&def);
        repo.create_run(&run).await.unwrap();

        let first = router
            .deliver(run.id, "reply_received", json!({}))
            .await
            .unwrap();
        assert!(matches!(first, SignalOutcome::Delivered { .. }));

        let second = router
            .deliver(run.id, "reply_received", json!({}))
            .await
            .unwrap();
        assert!(matches!(second, SignalOutcome::Ignored));
    }
}
