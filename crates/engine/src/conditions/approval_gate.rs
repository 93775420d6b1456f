use serde_json::{json, Value};

use super::path::resolve_path;
use crate::registry::Condition;

/// Reads `approval_gates[<name>].is_met`, recorded when a gate resolves.
pub struct ApprovalGateCondition;

impl Condition for ApprovalGateCondition {
    fn name(&self) -> &str {
        "approval_gate"
    }

    fn description(&self) -> &str {
        "Checks if an approval gate threshold is met or not met"
    }

    fn params_schema(&self) -> Value {
        json!({
            "approval_gate": {"type": "string", "required": true},
            "status": {"type": "string", "required": true, "enum": ["met", "not_met"]},
        })
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        let Some(gate) = params.get("approval_gate").and_then(Value::as_str) else {
            return false;
        };
        let Some(record) = resolve_path(context, "approval_gates")
            .as_object()
            .and_then(|gates| gates.get(gate))
        else {
            return false;
        };
        let is_met = record.get("is_met").and_then(Value::as_bool).unwrap_or(false);
        match params.get("status").and_then(Value::as_str).unwrap_or("met") {
            "met" => is_met,
            _ => !is_met,
        }
    }
}
