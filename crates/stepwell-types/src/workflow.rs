//! Workflow definition types for Stepwell.
//!
//! A `WorkflowDefinition` is an immutable-per-version graph of nodes. Every
//! publish bumps the version; in-flight runs keep executing against the
//! version they started with. Node configuration is a tagged union with a
//! strongly-typed payload per node kind, validated at publish time rather
//! than at execution time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// One published version of a workflow.
///
/// Immutable once a run references it: edits create a new version row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save. Stable across versions.
    pub id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version, bumped on every publish.
    pub version: u32,
    /// What starts a run of this workflow.
    pub trigger: TriggerKind,
    /// Action execution policy for this workflow.
    pub safety_level: SafetyLevel,
    /// Disabled workflows reject new runs; in-flight runs are unaffected.
    pub enabled: bool,
    /// The node graph. Exactly one trigger node; validated at publish time.
    pub nodes: Vec<NodeDefinition>,
    /// When this version was published.
    pub published_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a node by key.
    pub fn node(&self, key: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// The single trigger node, if present.
    ///
    /// Publish-time validation guarantees exactly one; `None` only occurs on
    /// definitions that were never validated.
    pub fn trigger_node(&self) -> Option<&NodeDefinition> {
        self.nodes
            .iter()
            .find(|n| matches!(n.config, NodeConfig::Trigger { .. }))
    }
}

/// What starts a run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Manually triggered via CLI or API.
    Manual {},
    /// Triggered by a named business event (e.g. "message_received").
    Event { name: String },
}

/// Action execution policy for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Never auto-execute: actions become pending suggestions awaiting a
    /// human decision signal.
    SuggestOnly,
    /// Execute, but mark output as a draft requiring approval before any
    /// externally visible side effect.
    DraftFirst,
    /// Execute immediately.
    Autopilot,
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// User-defined node key (e.g. "send-welcome"). Unique within a workflow.
    pub key: String,
    /// Human-readable node name.
    pub name: String,
    /// Kind-specific configuration, including successor keys.
    pub config: NodeConfig,
}

impl NodeDefinition {
    /// The kind of this node, derived from its configuration.
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Condition,
    Delay,
    Branch,
    Action,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Condition => "condition",
            NodeKind::Delay => "delay",
            NodeKind::Branch => "branch",
            NodeKind::Action => "action",
        };
        f.write_str(s)
    }
}

/// Node-kind-specific configuration payload.
///
/// Internally tagged by `kind` to match the on-disk YAML structure:
/// ```yaml
/// config:
///   kind: delay
///   minutes: 1440
///   next: follow-up
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// The entry node. Exactly one per workflow.
    Trigger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// Boolean filter: a true result continues to `next`, a false result
    /// completes the run.
    Condition {
        /// JEXL expression over `{input, vars, signals, output}`.
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// Suspend the run for a fixed duration.
    Delay {
        minutes: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// Two-way fork with labeled successors.
    Branch { split: BranchSplit },
    /// Invoke a capability (an opaque, idempotent business action).
    Action {
        /// Capability kind to invoke (e.g. "send_dm", "create_booking").
        capability: String,
        /// Capability-specific parameters, passed through opaquely.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
        /// If set, the run parks in `awaiting_signal` for this signal type
        /// after the capability succeeds (e.g. "wait for reply").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        await_signal: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
}

impl NodeConfig {
    /// The node kind this configuration belongs to.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Trigger { .. } => NodeKind::Trigger,
            NodeConfig::Condition { .. } => NodeKind::Condition,
            NodeConfig::Delay { .. } => NodeKind::Delay,
            NodeConfig::Branch { .. } => NodeKind::Branch,
            NodeConfig::Action { .. } => NodeKind::Action,
        }
    }

    /// All successor node keys referenced by this node.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            NodeConfig::Trigger { next }
            | NodeConfig::Condition { next, .. }
            | NodeConfig::Delay { next, .. }
            | NodeConfig::Action { next, .. } => {
                next.as_deref().into_iter().collect()
            }
            NodeConfig::Branch { split } => match split {
                BranchSplit::Percent { on_a, on_b, .. } => vec![on_a, on_b],
                BranchSplit::Expression { on_true, on_false, .. } => {
                    vec![on_true, on_false]
                }
            },
        }
    }

    /// The single linear successor, for non-branch nodes.
    pub fn linear_next(&self) -> Option<&str> {
        match self {
            NodeConfig::Trigger { next }
            | NodeConfig::Condition { next, .. }
            | NodeConfig::Delay { next, .. }
            | NodeConfig::Action { next, .. } => next.as_deref(),
            NodeConfig::Branch { .. } => None,
        }
    }
}

/// How a branch node selects between its two labeled successors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BranchSplit {
    /// Deterministic percentage split (A/B test). The bucket is derived by
    /// hashing a stable run identifier, so repeated evaluation of the same
    /// run always selects the same arm.
    Percent {
        /// Percentage of runs routed to `on_a` (0-100).
        percent_a: u8,
        on_a: String,
        on_b: String,
    },
    /// Boolean expression split.
    Expression {
        expression: String,
        on_true: String,
        on_false: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
