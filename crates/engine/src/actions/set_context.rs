use async_trait::async_trait;
use serde_json::{json, Value};

use crate::conditions::{compare::as_number, resolve_path};
use crate::registry::{Action, ActionResult, EntityDefinition};
use crate::{Error, Result};

fn required_str<'a>(params: &'a Value, key: &str, action: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Execution(format!("No {} specified for {} action", key, action)))
}

/// Stores a value in the instance context. The value `"increment"` adds one to the
/// current number at `key`.
pub struct SetContextAction;

#[async_trait]
impl Action for SetContextAction {
    fn name(&self) -> &str {
        "set_context"
    }

    fn description(&self) -> &str {
        "Sets a key in the workflow context"
    }

    fn input_schema(&self) -> Value {
        json!({
            "key": {"type": "string", "required": true},
            "value": {"type": "mixed", "required": true},
        })
    }

    fn validate_params(&self, params: &Value, _entity: Option<&EntityDefinition>) -> Result<()> {
        required_str(params, "key", self.name())
            .map(|_| ())
            .map_err(|e| Error::InvalidDefinition(e.to_string()))
    }

    async fn execute(&self, params: &Value, context: &Value) -> Result<ActionResult> {
        let key = required_str(params, "key", self.name())?;
        let mut value = params.get("value").cloned().unwrap_or(Value::Null);

        if value.as_str() == Some("increment") {
            let current = as_number(resolve_path(context, key)).unwrap_or(0.0);
            value = json!(current as i64 + 1);
        }

        Ok(ActionResult::output(json!({"key": key, "value": value.clone()})).with_update(key, value))
    }
}

/// Stores a named value under `variables.<name>`.
pub struct SetVariableAction;

#[async_trait]
impl Action for SetVariableAction {
    fn name(&self) -> &str {
        "set_variable"
    }

    fn description(&self) -> &str {
        "Sets a workflow variable"
    }

    fn input_schema(&self) -> Value {
        json!({
            "name": {"type": "string", "required": true},
            "value": {"type": "mixed", "required": true},
        })
    }

    fn validate_params(&self, params: &Value, _entity: Option<&EntityDefinition>) -> Result<()> {
        required_str(params, "name", self.name())
            .map(|_| ())
            .map_err(|e| Error::InvalidDefinition(e.to_string()))
    }

    async fn execute(&self, params: &Value, _context: &Value) -> Result<ActionResult> {
        let name = required_str(params, "name", self.name())?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        Ok(ActionResult::output(json!({"name": name, "value": value.clone()}))
            .with_update(&format!("variables.{}", name), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_reads_current_value() {
        let context = json!({"approval_count": 2});
        let result = SetContextAction
            .execute(&json!({"key": "approval_count", "value": "increment"}), &context)
            .await
            .unwrap();
        assert_eq!(result.context_updates["approval_count"], json!(3));

        let result = SetContextAction
            .execute(&json!({"key": "rounds", "value": "increment"}), &json!({}))
            .await
            .unwrap();
        assert_eq!(result.context_updates["rounds"], json!(1));
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let err = SetContextAction.execute(&json!({"value": 1}), &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(SetContextAction.validate_params(&json!({}), None).is_err());
    }

    #[tokio::test]
    async fn variables_are_namespaced() {
        let result = SetVariableAction
            .execute(&json!({"name": "reviewer", "value": 12}), &json!({}))
            .await
            .unwrap();
        assert_eq!(result.context_updates["variables.reviewer"], json!(12));
    }
}
