use serde_json::{json, Value};

use super::compare::{compare, is_empty};
use super::path::resolve_with_entity_fallback;
use crate::registry::Condition;

/// Compares a context field (falling back to `entity.<field>`) against a value.
pub struct FieldCondition;

impl Condition for FieldCondition {
    fn name(&self) -> &str {
        "field"
    }

    fn description(&self) -> &str {
        "Compares entity field values with support for dot notation and multiple operators"
    }

    fn params_schema(&self) -> Value {
        json!({
            "field": {"type": "string", "required": true},
            "operator": {
                "type": "string",
                "required": true,
                "enum": ["eq", "neq", "gt", "gte", "lt", "lte", "in", "not_in",
                         "is_set", "is_empty", "contains", "starts_with", "ends_with"],
            },
            "value": {"type": "mixed", "required": false},
        })
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        let Some(field) = params.get("field").and_then(Value::as_str) else {
            return false;
        };
        let operator = params.get("operator").and_then(Value::as_str).unwrap_or("eq");
        let actual = resolve_with_entity_fallback(context, field);

        match operator {
            "is_set" => !actual.is_null(),
            "is_empty" => is_empty(actual),
            _ => compare(actual, operator, params.get("value").unwrap_or(&Value::Null)),
        }
    }
}
