//! The safety gate: action execution policy enforcement.
//!
//! Runs *before* the executor dispatches an action node, never after.
//! Combines the workflow's safety level with a per-capability risk
//! classification: high-risk capabilities (refunds, chargebacks) require a
//! human decision regardless of level.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use stepwell_types::workflow::SafetyLevel;

/// What the gate allows for one action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Execute immediately.
    Allow,
    /// Execute, but flag the invocation and its output as a draft.
    RequireDraft,
    /// Do not execute: materialize a suggestion and park the run until a
    /// human decision signal arrives.
    Suspend,
}

/// Capability kinds that always require human approval, at any safety
/// level.
const DEFAULT_HIGH_RISK: &[&str] = &["refund", "chargeback", "cancel_booking"];

/// Pre-dispatch policy gate for action nodes.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    high_risk: HashSet<String>,
}

impl SafetyGate {
    /// Gate with the default high-risk classification.
    pub fn new() -> Self {
        Self {
            high_risk: DEFAULT_HIGH_RISK.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Gate with a custom high-risk capability list.
    pub fn with_high_risk<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_risk: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a capability kind is classified high-risk.
    pub fn is_high_risk(&self, capability: &str) -> bool {
        self.high_risk.contains(capability)
    }

    /// Decide how an action node may execute.
    pub fn authorize(&self, level: SafetyLevel, capability: &str) -> GateDecision {
        if self.is_high_risk(capability) {
            return GateDecision::Suspend;
        }
        match level {
            SafetyLevel::SuggestOnly => GateDecision::Suspend,
            SafetyLevel::DraftFirst => GateDecision::RequireDraft,
            SafetyLevel::Autopilot => GateDecision::Allow,
        }
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autopilot_allows_ordinary_actions() {
        let gate = SafetyGate::new();
        assert_eq!(
            gate.authorize(SafetyLevel::Autopilot, "send_dm"),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_draft_first_requires_draft() {
        let gate = SafetyGate::new();
        assert_eq!(
            gate.authorize(SafetyLevel::DraftFirst, "send_dm"),
            GateDecision::RequireDraft
        );
    }

    #[test]
    fn test_suggest_only_suspends_everything() {
        let gate = SafetyGate::new();
        assert_eq!(
            gate.authorize(SafetyLevel::SuggestOnly, "send_dm"),
            GateDecision::Suspend
        );
    }

    #[test]
    fn test_high_risk_suspends_at_any_level() {
        let gate = SafetyGate::new();
        for level in [
            SafetyLevel::SuggestOnly,
            SafetyLevel::DraftFirst,
            SafetyLevel::Autopilot,
        ] {
            assert_eq!(
                gate.authorize(level, "refund"),
                GateDecision::Suspend,
                "refund must suspend under {level:?}"
            );
        }
    }

    #[test]
    fn test_custom_high_risk_list() {
        let gate = SafetyGate::with_high_risk(["assign_owner"]);
        assert_eq!(
            gate.authorize(SafetyLevel::Autopilot, "assign_owner"),
            GateDecision::Suspend
        );
        // "refund" is no longer classified when the list is replaced.
        assert_eq!(
            gate.authorize(SafetyLevel::Autopilot, "refund"),
            GateDecision::Allow
        );
    }
}
