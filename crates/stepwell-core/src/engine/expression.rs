//! JEXL expression evaluator for condition nodes and expression branches.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms and
//! provides boolean evaluation against a run's evaluation context.
//!
//! **Security note:** run data is always passed as a context object, NEVER
//! interpolated into expression strings.

use serde_json::{Value, json};
use stepwell_types::run::WorkflowRun;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Condition node filters (e.g. `input.deposit_paid == true`)
/// - Expression branch splits (e.g. `input.amount > 100`)
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules. Missing properties evaluate
    /// to null (falsy), not an error; genuine parse errors surface as
    /// `EvalFailed`.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(value_to_bool(&result))
    }

    /// Evaluate an expression against a run's evaluation context.
    pub fn evaluate_for_run(
        &self,
        expression: &str,
        run: &WorkflowRun,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &run_context(run))
    }

    /// Check that an expression at least parses, by evaluating it against
    /// an empty context. Missing data is tolerated (null-propagating); a
    /// malformed expression is not. Used at publish time.
    pub fn check(&self, expression: &str) -> Result<(), ExpressionError> {
        let empty = json!({
            "input": {},
            "vars": {},
            "signals": {},
            "output": {},
        });
        self.evaluate_bool(expression, &empty).map(|_| ())
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Context construction
// ---------------------------------------------------------------------------

/// Build the JSON object that run expressions evaluate against.
///
/// Shape:
/// ```json
/// {
///   "input": <trigger payload>,
///   "vars": { ... },
///   "signals": { "<signal_type>": <payload>, ... },
///   "output": { "<node_key>": <action output>, ... }
/// }
/// ```
pub fn run_context(run: &WorkflowRun) -> Value {
    json!({
        "input": run.input,
        "vars": run.checkpoint.vars,
        "signals": run.checkpoint.signals,
        "output": run.output,
    })
}

/// JavaScript-like truthiness coercion.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
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
    use stepwell_types::run::{Checkpoint, RunStatus};
    use uuid::Uuid;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    fn sample_run() -> WorkflowRun {
        let mut checkpoint = Checkpoint::default();
        checkpoint.vars.insert("lead_score".to_string(), json!(87.0));
        checkpoint
            .signals
            .insert("reply_received".to_string(), json!({"text": "yes"}));
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "test-wf".to_string(),
            definition_version: 1,
            status: RunStatus::Running,
            current_node_key: Some("check".to_string()),
            step_index: 2,
            total_steps: 4,
            input: json!({"deposit_paid": true, "amount": 150.0}),
            output: json!({"remind": {"message_id": "m1"}}),
            checkpoint,
            retry_count: 0,
            next_retry_at: None,
            awaiting_signal: None,
            timer_expires_at: None,
            idempotency_key: "k".to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_dot_notation_against_input() {
        let run = sample_run();
        let eval = evaluator();
        assert!(eval
            .evaluate_for_run("input.deposit_paid == true", &run)
            .unwrap());
        assert!(!eval
            .evaluate_for_run("input.deposit_paid == false", &run)
            .unwrap());
    }

    #[test]
    fn test_vars_and_signals_visible() {
        let run = sample_run();
        let eval = evaluator();
        assert!(eval.evaluate_for_run("vars.lead_score > 50", &run).unwrap());
        assert!(eval
            .evaluate_for_run("signals.reply_received.text == 'yes'", &run)
            .unwrap());
    }

    #[test]
    fn test_prior_output_visible() {
        let run = sample_run();
        let eval = evaluator();
        assert!(eval
            .evaluate_for_run("output.remind.message_id == 'm1'", &run)
            .unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let run = sample_run();
        let eval = evaluator();
        assert!(eval
            .evaluate_for_run(
                "input.deposit_paid == true && input.amount > 100",
                &run
            )
            .unwrap());
        assert!(eval
            .evaluate_for_run(
                "input.amount > 1000 || vars.lead_score > 50",
                &run
            )
            .unwrap());
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let run = sample_run();
        let eval = evaluator();
        assert!(!eval.evaluate_for_run("input.nonexistent", &run).unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({ "input": { "name": "  Alice  ", "tags": ["a", "b"] } });
        let eval = evaluator();
        assert!(eval
            .evaluate_bool("input.name|trim|lower == 'alice'", &ctx)
            .unwrap());
        assert!(eval.evaluate_bool("input.tags|length > 1", &ctx).unwrap());
        assert!(eval
            .evaluate_bool("input.name|contains('Ali')", &ctx)
            .unwrap());
        assert!(eval.evaluate_bool("(input.missing)|not", &ctx).unwrap());
    }

    #[test]
    fn test_truthiness_coercion() {
        let eval = evaluator();
        let ctx = json!({ "val": "non-empty" });
        assert!(eval.evaluate_bool("val", &ctx).unwrap());
        let ctx = json!({ "val": "" });
        assert!(!eval.evaluate_bool("val", &ctx).unwrap());
        let ctx = json!({ "val": 0.0 });
        assert!(!eval.evaluate_bool("val", &ctx).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("true", &json!("not an object")).is_err());
    }

    #[test]
    fn test_check_accepts_valid_rejects_garbage() {
        let eval = evaluator();
        assert!(eval.check("input.deposit_paid == true").is_ok());
        assert!(eval.check("input.missing == null").is_ok());
        assert!(eval.check("== && ||").is_err());
    }
}
