use serde_json::{json, Value};

use super::compare::compare;
use super::path::resolve_path;
use crate::registry::Condition;

/// Compares a key accumulated in the instance context.
pub struct WorkflowContextCondition;

impl Condition for WorkflowContextCondition {
    fn name(&self) -> &str {
        "workflow_context"
    }

    fn description(&self) -> &str {
        "Checks accumulated workflow context data on the instance"
    }

    fn params_schema(&self) -> Value {
        json!({
            "workflow_context": {"type": "string", "required": true},
            "operator": {
                "type": "string",
                "required": true,
                "enum": ["eq", "neq", "gt", "gte", "lt", "lte", "in", "not_in"],
            },
            "value": {"type": "mixed", "required": true},
        })
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        let Some(key) = params.get("workflow_context").and_then(Value::as_str) else {
            return false;
        };
        let operator = params.get("operator").and_then(Value::as_str).unwrap_or("eq");

        let mut actual = resolve_path(context, &format!("instance.context.{}", key));
        if actual.is_null() {
            actual = resolve_path(context, key);
        }
        compare(actual, operator, params.get("value").unwrap_or(&Value::Null))
    }
}
