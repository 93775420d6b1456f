use serde_json::{json, Value};

use super::compare::loose_eq;
use super::path::resolve_path;
use crate::registry::Condition;

/// Relationship between the acting user and the entity.
pub struct OwnershipCondition;

fn is_requester(user_id: &Value, entity: &Value) -> bool {
    loose_eq(resolve_path(entity, "requester_id"), user_id)
        || loose_eq(resolve_path(entity, "created_by"), user_id)
}

fn is_recipient(user_id: &Value, entity: &Value) -> bool {
    loose_eq(resolve_path(entity, "member_id"), user_id)
}

fn is_parent_of_minor(context: &Value, entity: &Value) -> bool {
    let member_id = resolve_path(entity, "member_id");
    if member_id.is_null() {
        return false;
    }
    resolve_path(context, "user_managed_member_ids")
        .as_array()
        .map(|ids| ids.iter().any(|id| loose_eq(id, member_id)))
        .unwrap_or(false)
}

impl Condition for OwnershipCondition {
    fn name(&self) -> &str {
        "ownership"
    }

    fn description(&self) -> &str {
        "Checks the user's relationship to the entity (requester, recipient, parent_of_minor, any)"
    }

    fn params_schema(&self) -> Value {
        json!({
            "ownership": {
                "type": "string",
                "required": true,
                "enum": ["requester", "recipient", "parent_of_minor", "any"],
            },
        })
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        let user_id = resolve_path(context, "user_id");
        if user_id.is_null() {
            return false;
        }
        let entity = resolve_path(context, "entity");

        match params.get("ownership").and_then(Value::as_str) {
            Some("requester") => is_requester(user_id, entity),
            Some("recipient") => is_recipient(user_id, entity),
            Some("parent_of_minor") => is_parent_of_minor(context, entity),
            Some("any") => {
                is_requester(user_id, entity)
                    || is_recipient(user_id, entity)
                    || is_parent_of_minor(context, entity)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationships() {
        let context = json!({
            "user_id": 5,
            "user_managed_member_ids": [12],
            "entity": {"requester_id": "5", "member_id": 12},
        });
        let check = |kind: &str| OwnershipCondition.evaluate(&json!({"ownership": kind}), &context);

        assert!(check("requester"));
        assert!(!check("recipient"));
        assert!(check("parent_of_minor"));
        assert!(check("any"));
        assert!(!check("stranger"));
    }

    #[test]
    fn anonymous_user_owns_nothing() {
        let context = json!({"entity": {"member_id": null}});
        assert!(!OwnershipCondition.evaluate(&json!({"ownership": "any"}), &context));
    }
}
