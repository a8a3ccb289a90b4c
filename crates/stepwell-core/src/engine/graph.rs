//! Publish-time graph validation and step estimation.
//!
//! Uses `petgraph` to model node successors as a directed graph.
//! Topological sort detects cycles; a traversal from the trigger verifies
//! reachability. Validation here is the first line of defense -- the
//! executor's hop guard remains as a runtime safety net for definitions
//! that predate a validation rule.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepwell_types::workflow::{BranchSplit, NodeConfig, WorkflowDefinition};

use super::expression::ConditionEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors found while validating a workflow graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("workflow must have at least one node")]
    Empty,

    #[error("duplicate node key: '{0}'")]
    DuplicateKey(String),

    #[error("workflow must have exactly one trigger node, found {0}")]
    TriggerCount(usize),

    #[error("node '{node}' references unknown successor '{successor}'")]
    UnknownSuccessor { node: String, successor: String },

    #[error("node '{0}' is unreachable from the trigger")]
    Unreachable(String),

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("node '{node}' has an invalid expression: {reason}")]
    InvalidExpression { node: String, reason: String },

    #[error("branch node '{node}' percentage must be 0-100, got {percent}")]
    InvalidPercent { node: String, percent: u8 },

    #[error("delay node '{0}' must have a non-zero duration")]
    ZeroDelay(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the structural and expression constraints of a definition.
///
/// Checks:
/// - At least one node; all keys unique
/// - Exactly one trigger node
/// - All successor references resolve
/// - Every node reachable from the trigger
/// - The successor graph is acyclic (petgraph toposort)
/// - Branch percentages within 0-100; delays non-zero
/// - Condition and branch expressions parse
pub fn validate_graph(def: &WorkflowDefinition) -> Result<(), GraphError> {
    if def.nodes.is_empty() {
        return Err(GraphError::Empty);
    }

    // Unique keys
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.key.as_str()) {
            return Err(GraphError::DuplicateKey(node.key.clone()));
        }
    }

    // Exactly one trigger
    let trigger_count = def
        .nodes
        .iter()
        .filter(|n| matches!(n.config, NodeConfig::Trigger { .. }))
        .count();
    if trigger_count != 1 {
        return Err(GraphError::TriggerCount(trigger_count));
    }

    // Successor references and per-kind constraints
    let evaluator = ConditionEvaluator::new();
    for node in &def.nodes {
        for successor in node.config.successors() {
            if !seen.contains(successor) {
                return Err(GraphError::UnknownSuccessor {
                    node: node.key.clone(),
                    successor: successor.to_string(),
                });
            }
        }

        match &node.config {
            NodeConfig::Condition { expression, .. } => {
                evaluator.check(expression).map_err(|e| {
                    GraphError::InvalidExpression {
                        node: node.key.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
            NodeConfig::Branch { split } => match split {
                BranchSplit::Percent { percent_a, .. } => {
                    if *percent_a > 100 {
                        return Err(GraphError::InvalidPercent {
                            node: node.key.clone(),
                            percent: *percent_a,
                        });
                    }
                }
                BranchSplit::Expression { expression, .. } => {
                    evaluator.check(expression).map_err(|e| {
                        GraphError::InvalidExpression {
                            node: node.key.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            },
            NodeConfig::Delay { minutes, .. } => {
                if *minutes == 0 {
                    return Err(GraphError::ZeroDelay(node.key.clone()));
                }
            }
            _ => {}
        }
    }

    // Build the successor graph
    let id_to_idx: HashMap<&str, usize> = def
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.key.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = def
        .nodes
        .iter()
        .map(|n| graph.add_node(n.key.as_str()))
        .collect();

    for node in &def.nodes {
        let from = node_indices[id_to_idx[node.key.as_str()]];
        for successor in node.config.successors() {
            let to = node_indices[id_to_idx[successor]];
            graph.add_edge(from, to, ());
        }
    }

    // Acyclicity
    toposort(&graph, None).map_err(|cycle| {
        GraphError::CycleDetected(graph[cycle.node_id()].to_string())
    })?;

    // Reachability from the trigger
    let Some(trigger_key) = def.trigger_node().map(|n| n.key.as_str()) else {
        return Err(GraphError::TriggerCount(0));
    };
    let mut reachable = HashSet::new();
    let mut stack = vec![trigger_key];
    while let Some(current) = stack.pop() {
        if !reachable.insert(current) {
            continue;
        }
        if let Some(node) = def.node(current) {
            stack.extend(node.config.successors());
        }
    }
    for node in &def.nodes {
        if !reachable.contains(node.key.as_str()) {
            return Err(GraphError::Unreachable(node.key.clone()));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Step estimation
// ---------------------------------------------------------------------------

/// Best-effort estimate of total steps for progress display: the longest
/// path from the trigger, in hops.
///
/// Branch arms diverge, so the estimate follows the deeper arm. Only
/// meaningful on validated (acyclic) definitions; cyclic input falls back
/// to the node count.
pub fn estimate_total_steps(def: &WorkflowDefinition) -> u32 {
    let Some(trigger) = def.trigger_node() else {
        return def.nodes.len() as u32;
    };

    fn depth(
        def: &WorkflowDefinition,
        key: &str,
        visiting: &mut HashSet<String>,
        memo: &mut HashMap<String, u32>,
    ) -> u32 {
        if let Some(cached) = memo.get(key) {
            return *cached;
        }
        if !visiting.insert(key.to_string()) {
            // Cycle -- bail out; the validator rejects these anyway.
            return 0;
        }
        let d = match def.node(key) {
            Some(node) => {
                1 + node
                    .config
                    .successors()
                    .iter()
                    .map(|s| depth(def, s, visiting, memo))
                    .max()
                    .unwrap_or(0)
            }
            None => 0,
        };
        visiting.remove(key);
        memo.insert(key.to_string(), d);
        d
    }

    let mut visiting = HashSet::new();
    let mut memo = HashMap::new();
    depth(def, &trigger.key, &mut visiting, &mut memo)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
