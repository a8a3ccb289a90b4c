//! Dry-run simulation: walk a workflow graph without invoking capabilities.
//!
//! Used for authoring validation -- "what would this workflow do with this
//! input?" Conditions and expression branches evaluate against the sample
//! input; percent branches use the same stable hashing as the executor,
//! seeded by the workflow id so a given workflow always previews the same
//! arm. Delays and signal waits are reported, not waited on.

use serde_json::{Value, json};
use stepwell_types::workflow::{
    BranchSplit, NodeConfig, NodeKind, WorkflowDefinition,
};

use super::executor::DEFAULT_MAX_HOPS;
use super::expression::ConditionEvaluator;
use super::hash::stable_bucket;
use super::safety::{GateDecision, SafetyGate};

/// Errors from a simulation walk.
#[derive(Debug, thiserror::Error)]
pub enum SimulateError {
    #[error("workflow has no trigger node")]
    NoTriggerNode,

    #[error("node '{node}' expression failed: {reason}")]
    Expression { node: String, reason: String },

    #[error("node '{0}' not found")]
    MissingNode(String),

    #[error("simulation exceeded {0} hops (cycle?)")]
    HopGuard(u32),
}

/// One step of a simulated walk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SimulatedStep {
    pub node_key: String,
    pub kind: NodeKind,
    pub detail: SimulatedDetail,
}

/// What the engine would do at this node.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SimulatedDetail {
    Start,
    /// Condition result; `false` means the run would complete here.
    Condition { expression: String, result: bool },
    /// The run would suspend for this many minutes.
    Delay { minutes: u32 },
    /// The arm a real run of this workflow would take.
    Branch { selected: String },
    /// The capability that would be invoked, and how the gate rules on it.
    Action {
        capability: String,
        gate: GateDecision,
        awaits_signal: Option<String>,
    },
}

/// Walk the graph from the trigger with `sample_input`, reporting per-node
/// decisions without side effects.
pub fn simulate(
    def: &WorkflowDefinition,
    sample_input: &Value,
    gate: &SafetyGate,
) -> Result<Vec<SimulatedStep>, SimulateError> {
    let evaluator = ConditionEvaluator::new();
    let context = json!({
        "input": sample_input,
        "vars": {},
        "signals": {},
        "output": {},
    });

    let trigger = def.trigger_node().ok_or(SimulateError::NoTriggerNode)?;
    let mut steps = Vec::new();
    let mut current = Some(trigger.key.clone());
    let mut hops = 0u32;

    while let Some(key) = current.take() {
        hops += 1;
        if hops > DEFAULT_MAX_HOPS {
            return Err(SimulateError::HopGuard(DEFAULT_MAX_HOPS));
        }
        let node = def
            .node(&key)
            .ok_or_else(|| SimulateError::MissingNode(key.clone()))?;

        match &node.config {
            NodeConfig::Trigger { next } => {
                steps.push(SimulatedStep {
                    node_key: key,
                    kind: NodeKind::Trigger,
                    detail: SimulatedDetail::Start,
                });
                current = next.clone();
            }

            NodeConfig::Condition { expression, next } => {
                let result = evaluator
                    .evaluate_bool(expression, &context)
                    .map_err(|e| SimulateError::Expression {
                        node: key.clone(),
                        reason: e.to_string(),
                    })?;
                steps.push(SimulatedStep {
                    node_key: key,
                    kind: NodeKind::Condition,
                    detail: SimulatedDetail::Condition {
                        expression: expression.clone(),
                        result,
                    },
                });
                if result {
                    current = next.clone();
                }
            }

            NodeConfig::Delay { minutes, next } => {
                steps.push(SimulatedStep {
                    node_key: key,
                    kind: NodeKind::Delay,
                    detail: SimulatedDetail::Delay { minutes: *minutes },
                });
                current = next.clone();
            }

            NodeConfig::Branch { split } => {
                let selected = match split {
                    BranchSplit::Percent {
                        percent_a,
                        on_a,
                        on_b,
                    } => {
                        let bucket =
                            stable_bucket(&format!("{}:{}", def.id, key), 100);
                        if bucket < u64::from(*percent_a) {
                            on_a.clone()
                        } else {
                            on_b.clone()
                        }
                    }
                    BranchSplit::Expression {
                        expression,
                        on_true,
                        on_false,
                    } => {
                        let result = evaluator
                            .evaluate_bool(expression, &context)
                            .map_err(|e| SimulateError::Expression {
                                node: key.clone(),
                                reason: e.to_string(),
                            })?;
                        if result { on_true.clone() } else { on_false.clone() }
                    }
                };
                steps.push(SimulatedStep {
                    node_key: key,
                    kind: NodeKind::Branch,
                    detail: SimulatedDetail::Branch {
                        selected: selected.clone(),
                    },
                });
                current = Some(selected);
            }

            NodeConfig::Action {
                capability,
                await_signal,
                next,
                ..
            } => {
                steps.push(SimulatedStep {
                    node_key: key,
                    kind: NodeKind::Action,
                    detail: SimulatedDetail::Action {
                        capability: capability.clone(),
                        gate: gate.authorize(def.safety_level, capability),
                        awaits_signal: await_signal.clone(),
                    },
                });
                current = next.clone();
            }
        }
    }

    Ok(steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stepwell_types::workflow::{
        NodeDefinition, SafetyLevel, TriggerKind,
    };
    use uuid::Uuid;

    fn definition(safety_level: SafetyLevel) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "deposit-chase".to_string(),
            description: None,
            version: 1,
            trigger: TriggerKind::Manual {},
            safety_level,
            enabled: true,
            nodes: vec![
                NodeDefinition {
                    key: "start".to_string(),
                    name: "Start".to_string(),
                    config: NodeConfig::Trigger {
                        next: Some("check".to_string()),
                    },
                },
                NodeDefinition {
                    key: "check".to_string(),
                    name: "Check Paid".to_string(),
                    config: NodeConfig::Condition {
                        expression: "input.deposit_paid == false".to_string(),
                        next: Some("wait".to_string()),
                    },
                },
                NodeDefinition {
                    key: "wait".to_string(),
                    name: "Wait".to_string(),
                    config: NodeConfig::Delay {
                        minutes: 120,
                        next: Some("remind".to_string()),
                    },
                },
                NodeDefinition {
                    key: "remind".to_string(),
                    name: "Remind".to_string(),
                    config: NodeConfig::Action {
                        capability: "send_dm".to_string(),
                        params: json!({"template": "reminder"}),
                        await_signal: Some("reply_received".to_string()),
                        next: None,
                    },
                },
            ],
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_simulation_walks_full_path() {
        let def = definition(SafetyLevel::Autopilot);
        let steps = simulate(
            &def,
            &json!({"deposit_paid": false}),
            &SafetyGate::new(),
        )
        .unwrap();

        assert_eq!(steps.len(), 4);
        assert!(matches!(steps[0].detail, SimulatedDetail::Start));
        assert!(matches!(
            steps[1].detail,
            SimulatedDetail::Condition { result: true, .. }
        ));
        assert!(matches!(
            steps[2].detail,
            SimulatedDetail::Delay { minutes: 120 }
        ));
        match &steps[3].detail {
            SimulatedDetail::Action {
                capability,
                gate,
                awaits_signal,
            } => {
                assert_eq!(capability, "send_dm");
                assert_eq!(*gate, GateDecision::Allow);
                assert_eq!(awaits_signal.as_deref(), Some("reply_received"));
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_false_condition_stops_walk() {
        let def = definition(SafetyLevel::Autopilot);
        let steps = simulate(
            &def,
            &json!({"deposit_paid": true}),
            &SafetyGate::new(),
        )
        .unwrap();

        assert_eq!(steps.len(), 2, "walk stops at the failed condition");
        assert!(matches!(
            steps[1].detail,
            SimulatedDetail::Condition { result: false, .. }
        ));
    }

    #[test]
    fn test_gate_decisions_reported() {
        let def = definition(SafetyLevel::SuggestOnly);
        let steps = simulate(
            &def,
            &json!({"deposit_paid": false}),
            &SafetyGate::new(),
        )
        .unwrap();

        match &steps[3].detail {
            SimulatedDetail::Action { gate, .. } => {
                assert_eq!(*gate, GateDecision::Suspend);
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_percent_branch_preview_is_stable() {
        let mut def = definition(SafetyLevel::Autopilot);
        def.nodes = vec![
            NodeDefinition {
                key: "start".to_string(),
                name: "Start".to_string(),
                config: NodeConfig::Trigger {
                    next: Some("split".to_string()),
                },
            },
            NodeDefinition {
                key: "split".to_string(),
                name: "Split".to_string(),
                config: NodeConfig::Branch {
                    split: BranchSplit::Percent {
                        percent_a: 50,
                        on_a: "a".to_string(),
                        on_b: "b".to_string(),
                    },
                },
            },
            NodeDefinition {
                key: "a".to_string(),
                name: "A".to_string(),
                config: NodeConfig::Action {
                    capability: "send_dm".to_string(),
                    params: json!({}),
                    await_signal: None,
                    next: None,
                },
            },
            NodeDefinition {
                key: "b".to_string(),
                name: "B".to_string(),
                config: NodeConfig::Action {
                    capability: "send_dm".to_string(),
                    params: json!({}),
                    await_signal: None,
                    next: None,
                },
            },
        ];

        let first = simulate(&def, &json!({}), &SafetyGate::new()).unwrap();
        let second = simulate(&def, &json!({}), &SafetyGate::new()).unwrap();
        let arm = |steps: &[SimulatedStep]| match &steps[1].detail {
            SimulatedDetail::Branch { selected } => selected.clone(),
            other => panic!("expected branch, got {other:?}"),
        };
        assert_eq!(arm(&first), arm(&second), "preview is deterministic");
    }

    #[test]
    fn test_missing_trigger_errors() {
        let mut def = definition(SafetyLevel::Autopilot);
        def.nodes.remove(0);
        let err = simulate(&def, &json!({}), &SafetyGate::new()).unwrap_err();
        assert!(matches!(err, SimulateError::NoTriggerNode));
    }
}
