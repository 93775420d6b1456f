use serde_json::{json, Value};

use super::path::resolve_path;
use crate::registry::Condition;

fn list_contains(context: &Value, list: &str, wanted: &str) -> bool {
    resolve_path(context, list)
        .as_array()
        .map(|items| items.iter().any(|item| item.as_str() == Some(wanted)))
        .unwrap_or(false)
}

/// Acting user holds a permission (`user_permissions`).
pub struct PermissionCondition;

impl Condition for PermissionCondition {
    fn name(&self) -> &str {
        "permission"
    }

    fn description(&self) -> &str {
        "Checks if the user has a specific permission"
    }

    fn params_schema(&self) -> Value {
        json!({"permission": {"type": "string", "required": true}})
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        params
            .get("permission")
            .and_then(Value::as_str)
            .map(|permission| list_contains(context, "user_permissions", permission))
            .unwrap_or(false)
    }
}

/// Acting user holds a role (`user_roles`).
pub struct RoleCondition;

impl Condition for RoleCondition {
    fn name(&self) -> &str {
        "role"
    }

    fn description(&self) -> &str {
        "Checks if the user has a specific role"
    }

    fn params_schema(&self) -> Value {
        json!({"role": {"type": "string", "required": true}})
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        params
            .get("role")
            .and_then(Value::as_str)
            .map(|role| list_contains(context, "user_roles", role))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_exact() {
        let context = json!({
            "user_permissions": ["Officers.hire"],
            "user_roles": ["Seneschal"],
        });
        assert!(PermissionCondition.evaluate(&json!({"permission": "Officers.hire"}), &context));
        assert!(!PermissionCondition.evaluate(&json!({"permission": "Officers"}), &context));
        assert!(RoleCondition.evaluate(&json!({"role": "Seneschal"}), &context));
        assert!(!RoleCondition.evaluate(&json!({"role": "Crown"}), &json!({})));
    }
}
