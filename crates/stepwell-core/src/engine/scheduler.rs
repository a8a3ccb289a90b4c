//! Timer scheduler: wakes suspended runs whose timer has expired or whose
//! retry is due.
//!
//! Each tick lists due runs, then claims them one at a time with the
//! repository's atomic conditional updates before handing them to the
//! executor -- two scheduler instances never double-execute a run; a lost
//! claim is simply skipped. Node-level failures are recorded on the run by
//! the executor; only infrastructure errors surface from `tick`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stepwell_types::error::RepositoryError;
use tokio_util::sync::CancellationToken;

use crate::repository::engine::EngineRepository;

use super::executor::{ExecutorError, StepExecutor};

/// Default poll interval. Minute-level timer granularity is acceptable;
/// 30s keeps retries responsive without hammering the store.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default number of due runs processed per tick.
pub const DEFAULT_BATCH_LIMIT: u32 = 50;

/// Errors from scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Counters for one scheduler tick, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Due timer runs this worker claimed and resumed.
    pub timers_resumed: u32,
    /// Due retry runs this worker claimed and re-dispatched.
    pub retries_dispatched: u32,
    /// Due runs another worker claimed first.
    pub claims_lost: u32,
}

/// Polls the run store for due timers and retries.
pub struct TimerScheduler<R: EngineRepository> {
    repo: Arc<R>,
    executor: Arc<StepExecutor<R>>,
    poll_interval: Duration,
    batch_limit: u32,
    shutdown: CancellationToken,
}

impl<R: EngineRepository + 'static> TimerScheduler<R> {
    pub fn new(
        repo: Arc<R>,
        executor: Arc<StepExecutor<R>>,
        poll_interval: Duration,
        batch_limit: u32,
    ) -> Self {
        Self {
            repo,
            executor,
            poll_interval,
            batch_limit,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the polling loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the polling loop until the shutdown token fires.
    ///
    /// Infrastructure errors are logged and the loop keeps going -- a
    /// transiently unreachable store must not kill the worker.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.poll_interval.as_secs(),
            "timer scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("timer scheduler stopped");
                    return;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.timers_resumed + stats.retries_dispatched > 0 => {
                            tracing::debug!(
                                timers = stats.timers_resumed,
                                retries = stats.retries_dispatched,
                                lost = stats.claims_lost,
                                "scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        }
    }

    /// Process one batch of due runs. Exposed for tests and manual ticks.
    pub async fn tick(&self) -> Result<TickStats, SchedulerError> {
        let now = Utc::now();
        let mut stats = TickStats::default();

        for run_id in self.repo.list_due_timers(now, self.batch_limit).await? {
            match self.repo.claim_due_timer(&run_id, now).await? {
                Some(mut run) => {
                    stats.timers_resumed += 1;
                    if let Err(e) = self.executor.resume(&mut run).await {
                        log_executor_error(&run_id, "timer resume", &e);
                    }
                }
                None => stats.claims_lost += 1,
            }
        }

        for run_id in self.repo.list_due_retries(now, self.batch_limit).await? {
            match self.repo.claim_due_retry(&run_id, now).await? {
                Some(mut run) => {
                    stats.retries_dispatched += 1;
                    if let Err(e) = self.executor.drive(&mut run).await {
                        log_executor_error(&run_id, "retry dispatch", &e);
                    }
                }
                None => stats.claims_lost += 1,
            }
        }

        Ok(stats)
    }
}

fn log_executor_error(run_id: &uuid::Uuid, phase: &str, error: &ExecutorError) {
    tracing::error!(run_id = %run_id, phase, error = %error, "executor failed on claimed run");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use stepwell_types::run::{Checkpoint, RunStatus, WorkflowRun};
    use stepwell_types::workflow::{
        NodeConfig, NodeDefinition, SafetyLevel, TriggerKind, WorkflowDefinition,
    };
    use uuid::Uuid;

    use crate::engine::capability::{CapabilityRegistry, NoopCapability};
    use crate::engine::executor::ExecutorConfig;
    use crate::engine::safety::SafetyGate;
    use crate::event::bus::EventBus;
    use crate::repository::memory::MemoryRepository;

    fn delay_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "delayed".to_string(),
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
                        next: Some("wait".to_string()),
                    },
                },
                NodeDefinition {
                    key: "wait".to_string(),
                    name: "Wait".to_string(),
                    config: NodeConfig::Delay {
                        minutes: 60,
                        next: Some("ping".to_string()),
                    },
                },
                NodeDefinition {
                    key: "ping".to_string(),
                    name: "Ping".to_string(),
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

    async fn scheduler_for(
        def: &WorkflowDefinition,
    ) -> (Arc<MemoryRepository>, TimerScheduler<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        repo.publish_definition(def).await.unwrap();
        let registry = CapabilityRegistry::new();
        registry.register(std::sync::Arc::new(NoopCapability::new("noop")));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&repo),
            registry,
            SafetyGate::new(),
            EventBus::new(64),
            ExecutorConfig::default(),
        ));
        let scheduler = TimerScheduler::new(
            Arc::clone(&repo),
            executor,
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            DEFAULT_BATCH_LIMIT,
        );
        (repo, scheduler)
    }

    fn parked_run(def: &WorkflowDefinition, expired: bool) -> WorkflowRun {
        let offset = if expired {
            -ChronoDuration::minutes(1)
        } else {
            ChronoDuration::hours(1)
        };
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_name: def.name.clone(),
            definition_version: 1,
            status: RunStatus::AwaitingTimer,
            current_node_key: Some("wait".to_string()),
            step_index: 2,
            total_steps: 3,
            input: json!({}),
            output: json!({}),
            checkpoint: Checkpoint::default(),
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: None,
            timer_expires_at: Some(Utc::now() + offset),
            idempotency_key: Uuid::now_v7().to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn tick_before_expiry_leaves_run_unchanged() {
        let def = delay_definition();
        let (repo, scheduler) = scheduler_for(&def).await;
        let run = parked_run(&def, false);
        repo.create_run(&run).await.unwrap();

        let stats = scheduler.tick().await.unwrap();
        assert_eq!(stats, TickStats::default());

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::AwaitingTimer);
        assert!(stored.timer_expires_at.is_some());
    }

    #[tokio::test]
    async fn tick_after_expiry_resumes_and_completes_run() {
        let def = delay_definition();
        let (repo, scheduler) = scheduler_for(&def).await;
        let run = parked_run(&def, true);
        repo.create_run(&run).await.unwrap();

        let stats = scheduler.tick().await.unwrap();
        assert_eq!(stats.timers_resumed, 1);

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.output.get("ping").is_some());
    }

    #[tokio::test]
    async fn second_tick_finds_nothing_due() {
        let def = delay_definition();
        let (repo, scheduler) = scheduler_for(&def).await;
        let run = parked_run(&def, true);
        repo.create_run(&run).await.unwrap();

        scheduler.tick().await.unwrap();
        let stats = scheduler.tick().await.unwrap();
        assert_eq!(stats, TickStats::default(), "each due timer fires once");
    }

    #[tokio::test]
    async fn polling_loop_stops_on_shutdown() {
        let def = delay_definition();
        let (_repo, scheduler) = scheduler_for(&def).await;
        let scheduler = Arc::new(scheduler);
        let token = scheduler.shutdown_token();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits promptly")
            .unwrap();
    }
}
