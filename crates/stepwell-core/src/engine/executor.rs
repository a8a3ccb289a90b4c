//! The step executor: advances runs node-by-node through their graph.
//!
//! `advance` executes exactly one node; `drive` loops until the run
//! suspends, completes, or fails. Every transition is persisted before the
//! executor moves forward, so a crashed worker resumes from the stored row.
//!
//! # Execution flow per node
//!
//! 1. Load the pinned definition version and the current node.
//! 2. Action nodes pass through the safety gate, then the attempt memo:
//!    a completed result for `(run, node, attempt)` is replayed instead of
//!    re-invoking the capability (the crash-safety guarantee).
//! 3. The outcome advances the run, suspends it (timer/signal), schedules
//!    a retry with backoff, or quarantines it into the dead-letter queue.
//!
//! Node-level failures never escape as errors -- they become run
//! transitions. `ExecutorError` carries only infrastructure failures.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use stepwell_types::error::RepositoryError;
use stepwell_types::event::EngineEvent;
use stepwell_types::run::{
    AttemptRecord, HUMAN_DECISION_SIGNAL, RunStatus, WorkflowRun,
};
use stepwell_types::workflow::{BranchSplit, NodeConfig, SafetyLevel};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::engine::EngineRepository;

use super::backoff::RetryPolicy;
use super::capability::{
    CapabilityOutcome, CapabilityRegistry, CapabilityRequest,
};
use super::dead_letter;
use super::expression::{ConditionEvaluator, run_context};
use super::hash::stable_bucket;
use super::safety::{GateDecision, SafetyGate};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default cap on node hops per run. A misconfigured graph that slips past
/// publish-time validation hits this instead of looping forever.
pub const DEFAULT_MAX_HOPS: u32 = 256;

/// Executor tuning, sourced from `EngineConfig` at wiring time.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hop guard: maximum nodes one run may execute.
    pub max_hops: u32,
    /// Retry schedule for retryable capability failures.
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

/// The result of executing one node (or of driving a run to rest).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The run moved to its successor; `drive` continues the loop.
    Advanced,
    /// The run reached the end of its graph.
    Completed,
    /// Suspended on a delay timer.
    AwaitingTimer { expires_at: chrono::DateTime<chrono::Utc> },
    /// Suspended waiting for an external signal.
    AwaitingSignal { signal_type: String },
    /// A retryable failure was recorded; the scheduler will re-claim.
    Retrying { next_retry_at: chrono::DateTime<chrono::Utc> },
    /// The run failed permanently; quarantined unless cancelled.
    Failed { dead_letter_id: Option<Uuid> },
}

/// Infrastructure-level executor failures.
///
/// These propagate to the worker's own health loop; everything else is
/// recorded on the run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("run {0} is already terminal")]
    Terminal(Uuid),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Advances runs through their node graph.
///
/// Generic over `R: EngineRepository` for storage flexibility. Stateless
/// per call: all coordination happens through the repository's atomic
/// claims, so any number of executors may run concurrently.
pub struct StepExecutor<R: EngineRepository> {
    repo: Arc<R>,
    capabilities: CapabilityRegistry,
    gate: SafetyGate,
    evaluator: ConditionEvaluator,
    events: EventBus,
    config: ExecutorConfig,
}

impl<R: EngineRepository> StepExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        capabilities: CapabilityRegistry,
        gate: SafetyGate,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            repo,
            capabilities,
            gate,
            evaluator: ConditionEvaluator::new(),
            events,
            config,
        }
    }

    /// Drive a claimed run until it suspends, completes, or fails.
    pub async fn drive(
        &self,
        run: &mut WorkflowRun,
    ) -> Result<StepOutcome, ExecutorError> {
        if run.status.is_terminal() {
            return Err(ExecutorError::Terminal(run.id));
        }
        loop {
            let outcome = self.advance(run).await?;
            if outcome != StepOutcome::Advanced {
                return Ok(outcome);
            }
        }
    }

    /// Resume a run after its suspension lifted (timer expired or awaited
    /// signal arrived). The caller must have claimed the run already.
    ///
    /// An approval park re-dispatches the action node itself so the human
    /// decision can be applied; any other suspension advances past the
    /// suspended node.
    pub async fn resume(
        &self,
        run: &mut WorkflowRun,
    ) -> Result<StepOutcome, ExecutorError> {
        if run.status.is_terminal() {
            return Err(ExecutorError::Terminal(run.id));
        }

        if run.checkpoint.pending_approval.is_some()
            && run.checkpoint.pending_approval == run.current_node_key
        {
            return self.drive(run).await;
        }

        let Some(node_key) = run.current_node_key.clone() else {
            return self.complete(run).await;
        };
        let Some(def) = self
            .repo
            .get_definition(&run.workflow_id, run.definition_version)
            .await?
        else {
            let reason = missing_definition(run);
            return self.quarantine(run, &node_key, reason, false).await;
        };
        let Some(node) = def.node(&node_key) else {
            let reason = missing_node(&node_key, run);
            return self.quarantine(run, &node_key, reason, false).await;
        };

        let next = node.config.linear_next().map(str::to_string);
        match self.advance_to(run, next.as_deref()).await? {
            StepOutcome::Advanced => self.drive(run).await,
            other => Ok(other),
        }
    }

    /// Execute exactly one node.
    pub async fn advance(
        &self,
        run: &mut WorkflowRun,
    ) -> Result<StepOutcome, ExecutorError> {
        let Some(node_key) = run.current_node_key.clone() else {
            return self.complete(run).await;
        };

        if run.step_index >= self.config.max_hops {
            let reason = format!(
                "hop guard tripped after {} steps (limit {})",
                run.step_index, self.config.max_hops
            );
            return self.quarantine(run, &node_key, reason, false).await;
        }

        let Some(def) = self
            .repo
            .get_definition(&run.workflow_id, run.definition_version)
            .await?
        else {
            let reason = missing_definition(run);
            return self.quarantine(run, &node_key, reason, false).await;
        };
        let Some(node) = def.node(&node_key) else {
            let reason = missing_node(&node_key, run);
            return self.quarantine(run, &node_key, reason, false).await;
        };
        let config = node.config.clone();
        let safety_level = def.safety_level;

        match config {
            NodeConfig::Trigger { next } => {
                self.advance_to(run, next.as_deref()).await
            }

            NodeConfig::Condition { expression, next } => {
                match self.evaluator.evaluate_for_run(&expression, run) {
                    Err(e) => {
                        self.quarantine(
                            run,
                            &node_key,
                            format!("condition expression failed: {e}"),
                            false,
                        )
                        .await
                    }
                    Ok(true) => self.advance_to(run, next.as_deref()).await,
                    Ok(false) => {
                        tracing::debug!(
                            run_id = %run.id,
                            node_key = node_key.as_str(),
                            "condition filtered run out"
                        );
                        self.complete(run).await
                    }
                }
            }

            NodeConfig::Delay { minutes, .. } => {
                let expires_at = Utc::now() + Duration::minutes(i64::from(minutes));
                run.status = RunStatus::AwaitingTimer;
                run.timer_expires_at = Some(expires_at);
                run.awaiting_signal = None;
                self.repo.update_run(run).await?;
                self.events.publish(EngineEvent::RunAwaitingTimer {
                    run_id: run.id,
                    node_key,
                    expires_at,
                });
                Ok(StepOutcome::AwaitingTimer { expires_at })
            }

            NodeConfig::Branch { split } => {
                let target = match split {
                    BranchSplit::Percent {
                        percent_a,
                        on_a,
                        on_b,
                    } => {
                        let bucket =
                            stable_bucket(&format!("{}:{}", run.id, node_key), 100);
                        if bucket < u64::from(percent_a) { on_a } else { on_b }
                    }
                    BranchSplit::Expression {
                        expression,
                        on_true,
                        on_false,
                    } => match self.evaluator.evaluate_for_run(&expression, run) {
                        Err(e) => {
                            return self
                                .quarantine(
                                    run,
                                    &node_key,
                                    format!("branch expression failed: {e}"),
                                    false,
                                )
                                .await;
                        }
                        Ok(true) => on_true,
                        Ok(false) => on_false,
                    },
                };
                self.advance_to(run, Some(&target)).await
            }

            NodeConfig::Action {
                capability,
                params,
                await_signal,
                next,
            } => {
                self.execute_action(
                    run,
                    &node_key,
                    safety_level,
                    &capability,
                    params,
                    await_signal,
                    next,
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Action dispatch
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn execute_action(
        &self,
        run: &mut WorkflowRun,
        node_key: &str,
        safety_level: SafetyLevel,
        capability: &str,
        params: Value,
        await_signal: Option<String>,
        next: Option<String>,
    ) -> Result<StepOutcome, ExecutorError> {
        let decision_pending =
            run.checkpoint.pending_approval.as_deref() == Some(node_key);

        // A decision recorded on an earlier dispatch of this node (e.g. an
        // approval followed by a retryable failure) keeps the gate open.
        let previously_approved = run
            .checkpoint
            .suggestions
            .get(node_key)
            .and_then(|s| s.get("approved"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut draft = false;
        if decision_pending {
            run.checkpoint.pending_approval = None;
            let decision = run.checkpoint.signals.remove(HUMAN_DECISION_SIGNAL);
            let approved = decision
                .as_ref()
                .and_then(|d| d.get("approved"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !approved {
                tracing::info!(
                    run_id = %run.id,
                    node_key,
                    capability,
                    "suggestion declined by operator"
                );
                run.checkpoint.suggestions.insert(
                    node_key.to_string(),
                    json!({
                        "capability": capability,
                        "params": params,
                        "declined": true,
                    }),
                );
                return self.complete(run).await;
            }
            run.checkpoint.suggestions.insert(
                node_key.to_string(),
                json!({
                    "capability": capability,
                    "params": params.clone(),
                    "approved": true,
                }),
            );
        } else if !previously_approved {
            match self.gate.authorize(safety_level, capability) {
                GateDecision::Allow => {}
                GateDecision::RequireDraft => draft = true,
                GateDecision::Suspend => {
                    run.checkpoint.pending_approval = Some(node_key.to_string());
                    run.checkpoint.suggestions.insert(
                        node_key.to_string(),
                        json!({
                            "capability": capability,
                            "params": params,
                        }),
                    );
                    run.status = RunStatus::AwaitingSignal;
                    run.awaiting_signal = Some(HUMAN_DECISION_SIGNAL.to_string());
                    run.timer_expires_at = None;
                    self.repo.update_run(run).await?;
                    self.events.publish(EngineEvent::SuggestionPending {
                        run_id: run.id,
                        node_key: node_key.to_string(),
                        capability: capability.to_string(),
                    });
                    self.events.publish(EngineEvent::RunAwaitingSignal {
                        run_id: run.id,
                        node_key: node_key.to_string(),
                        signal_type: HUMAN_DECISION_SIGNAL.to_string(),
                    });
                    return Ok(StepOutcome::AwaitingSignal {
                        signal_type: HUMAN_DECISION_SIGNAL.to_string(),
                    });
                }
            }
        }

        let attempt = run.retry_count;
        let memoized = self.repo.get_attempt(&run.id, node_key, attempt).await?;
        let outcome = match memoized {
            Some(record) => {
                tracing::debug!(
                    run_id = %run.id,
                    node_key,
                    attempt,
                    "replaying memoized capability result"
                );
                CapabilityOutcome::Success {
                    output: record.output,
                }
            }
            None => {
                let Some(cap) = self.capabilities.get(capability) else {
                    return self
                        .quarantine(
                            run,
                            node_key,
                            format!("unknown capability kind '{capability}'"),
                            false,
                        )
                        .await;
                };
                let request = CapabilityRequest {
                    run_id: run.id,
                    node_key: node_key.to_string(),
                    capability: capability.to_string(),
                    params: params.clone(),
                    input: run.input.clone(),
                    context: run_context(run),
                    idempotency_key: format!("{}:{}:{}", run.id, node_key, attempt),
                    draft,
                };
                let outcome = cap.invoke(request).await;
                if let CapabilityOutcome::Success { output } = &outcome {
                    self.repo
                        .record_attempt(&AttemptRecord {
                            run_id: run.id,
                            node_key: node_key.to_string(),
                            attempt,
                            output: output.clone(),
                            completed_at: Utc::now(),
                        })
                        .await?;
                }
                outcome
            }
        };

        match outcome {
            CapabilityOutcome::Success { output } => {
                let stored = if draft {
                    json!({ "draft": true, "output": output })
                } else {
                    output
                };
                match &mut run.output {
                    Value::Object(map) => {
                        map.insert(node_key.to_string(), stored);
                    }
                    other => *other = json!({ node_key: stored }),
                }
                run.retry_count = 0;
                run.error = None;

                if let Some(signal_type) = await_signal {
                    run.status = RunStatus::AwaitingSignal;
                    run.awaiting_signal = Some(signal_type.clone());
                    run.timer_expires_at = None;
                    self.repo.update_run(run).await?;
                    self.events.publish(EngineEvent::RunAwaitingSignal {
                        run_id: run.id,
                        node_key: node_key.to_string(),
                        signal_type: signal_type.clone(),
                    });
                    Ok(StepOutcome::AwaitingSignal { signal_type })
                } else {
                    self.advance_to(run, next.as_deref()).await
                }
            }

            CapabilityOutcome::RetryableFailure { reason } => {
                if self.config.retry.should_retry(run.retry_count) {
                    run.retry_count += 1;
                    let next_retry_at = self.config.retry.next_retry_at(
                        run.id,
                        run.retry_count,
                        Utc::now(),
                    );
                    run.status = RunStatus::Retrying;
                    run.next_retry_at = Some(next_retry_at);
                    run.error = Some(reason.clone());
                    self.repo.update_run(run).await?;
                    tracing::info!(
                        run_id = %run.id,
                        node_key,
                        attempt = run.retry_count,
                        next_retry_at = %next_retry_at,
                        reason = reason.as_str(),
                        "scheduling retry"
                    );
                    self.events.publish(EngineEvent::RunRetrying {
                        run_id: run.id,
                        node_key: node_key.to_string(),
                        attempt: run.retry_count,
                        next_retry_at,
                        error: reason,
                    });
                    Ok(StepOutcome::Retrying { next_retry_at })
                } else {
                    self.quarantine(
                        run,
                        node_key,
                        format!(
                            "retries exhausted after {} attempts: {reason}",
                            run.retry_count + 1
                        ),
                        true,
                    )
                    .await
                }
            }

            CapabilityOutcome::FatalFailure { reason } => {
                self.quarantine(run, node_key, reason, false).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn advance_to(
        &self,
        run: &mut WorkflowRun,
        next: Option<&str>,
    ) -> Result<StepOutcome, ExecutorError> {
        match next {
            Some(key) => {
                run.current_node_key = Some(key.to_string());
                run.step_index += 1;
                self.repo.update_run(run).await?;
                self.events.publish(EngineEvent::RunAdvanced {
                    run_id: run.id,
                    node_key: key.to_string(),
                    step_index: run.step_index,
                });
                Ok(StepOutcome::Advanced)
            }
            None => self.complete(run).await,
        }
    }

    async fn complete(
        &self,
        run: &mut WorkflowRun,
    ) -> Result<StepOutcome, ExecutorError> {
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.timer_expires_at = None;
        run.awaiting_signal = None;
        run.next_retry_at = None;
        self.repo.update_run(run).await?;
        tracing::info!(
            run_id = %run.id,
            workflow = run.workflow_name.as_str(),
            steps = run.step_index,
            "run completed"
        );
        self.events.publish(EngineEvent::RunCompleted {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            steps_completed: run.step_index,
        });
        Ok(StepOutcome::Completed)
    }

    async fn quarantine(
        &self,
        run: &mut WorkflowRun,
        node_key: &str,
        reason: String,
        can_retry: bool,
    ) -> Result<StepOutcome, ExecutorError> {
        let dl = dead_letter::quarantine(
            self.repo.as_ref(),
            &self.events,
            run,
            node_key,
            reason,
            can_retry,
        )
        .await?;
        Ok(StepOutcome::Failed {
            dead_letter_id: Some(dl.id),
        })
    }
}

fn missing_definition(run: &WorkflowRun) -> String {
    format!(
        "definition {} version {} not found",
        run.workflow_id, run.definition_version
    )
}

fn missing_node(node_key: &str, run: &WorkflowRun) -> String {
    format!(
        "node '{node_key}' not present in definition version {}",
        run.definition_version
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
