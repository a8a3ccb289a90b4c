//! Run execution state: the durable record of each workflow execution
//! instance, plus dead letters, signals, and the attempt memo used for
//! crash-safe idempotent replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved signal type carrying human approval decisions for
/// suggest-only workflows.
pub const HUMAN_DECISION_SIGNAL: &str = "human_decision";

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Status of a workflow run.
///
/// `Completed` and `Failed` are terminal: the store rejects any further
/// transition once either is reached. `Running` and `Retrying` may cycle up
/// to the configured retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Retrying,
    AwaitingSignal,
    AwaitingTimer,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// The snake_case string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Retrying => "retrying",
            RunStatus::AwaitingSignal => "awaiting_signal",
            RunStatus::AwaitingTimer => "awaiting_timer",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "retrying" => Some(RunStatus::Retrying),
            "awaiting_signal" => Some(RunStatus::AwaitingSignal),
            "awaiting_timer" => Some(RunStatus::AwaitingTimer),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// The state snapshot a run carries between steps, enabling resume after
/// suspension or crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Variables bound by earlier nodes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vars: HashMap<String, Value>,
    /// Payloads of signals received so far, keyed by signal type.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub signals: HashMap<String, Value>,
    /// Set while the run is parked pre-execution on an approval gate: the
    /// key of the action node awaiting a human decision. Distinguishes an
    /// approval park from a post-action signal wait on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<String>,
    /// Materialized action suggestions for suggest-only workflows, keyed by
    /// node key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub suggestions: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// One execution instance of a workflow definition version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// ID of the workflow being executed.
    pub workflow_id: Uuid,
    /// Name of the workflow (denormalized for display).
    pub workflow_name: String,
    /// The definition version this run is pinned to.
    pub definition_version: u32,
    /// Current run status.
    pub status: RunStatus,
    /// Key of the node the run is at. `None` once completed past the last
    /// node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_key: Option<String>,
    /// Number of node hops executed so far.
    pub step_index: u32,
    /// Best-effort estimate of total steps, for progress display.
    pub total_steps: u32,
    /// Immutable trigger payload.
    pub input: Value,
    /// Accumulated per-node action outputs, keyed by node key.
    pub output: Value,
    /// Resume state (vars, received signals, approval markers).
    pub checkpoint: Checkpoint,
    /// Retryable failures consumed so far at the current node.
    pub retry_count: u32,
    /// When the next retry is due (status `retrying` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Signal type the run is parked on (status `awaiting_signal` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_signal: Option<String>,
    /// When the timer expires (status `awaiting_timer` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_expires_at: Option<DateTime<Utc>>,
    /// Derived from trigger source + workflow id; prevents duplicate runs
    /// for the same external event.
    pub idempotency_key: String,
    /// Human-readable failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Dead Letter
// ---------------------------------------------------------------------------

/// How a dead letter was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// A new run was cloned from the quarantined one.
    Retried,
    /// Dismissed without further action.
    Dismissed,
    /// Handled out of band (e.g. the action was performed manually).
    Resolved,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Retried => "retried",
            ResolutionAction::Dismissed => "dismissed",
            ResolutionAction::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retried" => Some(ResolutionAction::Retried),
            "dismissed" => Some(ResolutionAction::Dismissed),
            "resolved" => Some(ResolutionAction::Resolved),
            _ => None,
        }
    }
}

/// A permanently failed run preserved for manual inspection and replay.
///
/// Created once, mutated only to attach a resolution, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// UUIDv7 dead letter ID.
    pub id: Uuid,
    /// The quarantined run.
    pub run_id: Uuid,
    /// The workflow the run belonged to.
    pub workflow_id: Uuid,
    /// Key of the node that failed.
    pub node_key: String,
    /// Human-readable failure reason (never a raw stack trace).
    pub reason: String,
    /// Full input snapshot, for replay.
    pub input: Value,
    /// Whether a replay could plausibly succeed (false for config bugs).
    pub can_retry: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_action: Option<ResolutionAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DeadLetter {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// An inbound external event targeted at a waiting run. Consumed at most
/// once; unmatched signals are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub run_id: Uuid,
    pub signal_type: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(run_id: Uuid, signal_type: impl Into<String>, payload: Value) -> Self {
        Self {
            run_id,
            signal_type: signal_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt memo
// ---------------------------------------------------------------------------

/// Record of a completed capability invocation, keyed by
/// `(run_id, node_key, attempt)`.
///
/// Consulted before every action dispatch: a crash between the capability
/// call and the run-row update is healed by replaying the memo instead of
/// re-invoking the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub run_id: Uuid,
    pub node_key: String,
    /// The retry count at which this attempt ran (0 = first attempt).
    pub attempt: u32,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
