//! The capability interface: opaque, idempotent business actions.
//!
//! The engine has no knowledge of what "send a message" or "create a
//! booking" means -- concrete actions are external collaborators
//! implementing [`Capability`]. The engine guarantees at-most-once
//! observable execution per `(run, node, attempt)` by passing an
//! idempotency key with every invocation and memoizing completed results.
//!
//! The trait returns boxed futures rather than using native async fn so it
//! stays object-safe -- the registry holds heterogeneous `Arc<dyn
//! Capability>` values. The trait lives in core; side-effecting
//! implementations live in infra.

use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Result of a capability invocation.
///
/// Failures are data, not `Err`: the executor classifies them into retry
/// or quarantine paths. Only infrastructure problems (store unreachable)
/// surface as errors elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    /// The action completed; `output` is merged into the run.
    Success { output: Value },
    /// Transient failure (rate limit, timeout, 5xx) -- worth retrying.
    RetryableFailure { reason: String },
    /// Permanent failure (bad config, validation) -- retrying cannot help.
    FatalFailure { reason: String },
}

/// Everything a capability needs to perform one invocation.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub run_id: Uuid,
    pub node_key: String,
    /// Capability kind (e.g. "send_dm").
    pub capability: String,
    /// Node-level parameters from the workflow definition.
    pub params: Value,
    /// The run's immutable trigger payload.
    pub input: Value,
    /// Evaluation context snapshot (vars, signals, prior outputs).
    pub context: Value,
    /// `{run_id}:{node_key}:{attempt}` -- implementations must treat a
    /// repeated key as already-performed work.
    pub idempotency_key: String,
    /// Set under the draft-first safety level: produce the artifact but
    /// hold any externally visible side effect for approval.
    pub draft: bool,
}

/// An opaque, idempotent unit of business work.
pub trait Capability: Send + Sync {
    /// The capability kind this implementation handles.
    fn kind(&self) -> &str;

    /// Perform (or replay) the action described by `request`.
    fn invoke(
        &self,
        request: CapabilityRequest,
    ) -> Pin<Box<dyn Future<Output = CapabilityOutcome> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps capability kinds to implementations.
///
/// Cloning is cheap; the map is shared.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: Arc<DashMap<String, Arc<dyn Capability>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own kind. Replaces any previous
    /// registration for that kind.
    pub fn register(&self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.kind().to_string(), capability);
    }

    /// Look up a capability by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(kind).map(|entry| entry.value().clone())
    }

    /// Registered capability kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .capabilities
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in: no-op capability
// ---------------------------------------------------------------------------

/// A capability that logs and echoes its parameters.
///
/// Useful for authoring workflows before the real action exists, and as a
/// stand-in in tests.
pub struct NoopCapability {
    kind: String,
}

impl NoopCapability {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl Capability for NoopCapability {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn invoke(
        &self,
        request: CapabilityRequest,
    ) -> Pin<Box<dyn Future<Output = CapabilityOutcome> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(
                capability = request.capability.as_str(),
                node_key = request.node_key.as_str(),
                draft = request.draft,
                "noop capability invoked"
            );
            CapabilityOutcome::Success {
                output: serde_json::json!({
                    "capability": request.capability,
                    "params": request.params,
                    "noop": true,
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
