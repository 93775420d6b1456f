use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::{Action, ActionResult, EntityDefinition};
use crate::template::has_placeholders;
use crate::{Error, Result};

/// Records a new value for an entity field in `context.entity`. Persisting the entity is
/// left to the owning plugin, which reads the `entity` context after the step.
pub struct SetFieldAction;

#[async_trait]
impl Action for SetFieldAction {
    fn name(&self) -> &str {
        "set_field"
    }

    fn description(&self) -> &str {
        "Sets a field on the workflow entity"
    }

    fn input_schema(&self) -> Value {
        json!({
            "field": {"type": "string", "required": true},
            "value": {"type": "mixed", "required": true},
        })
    }

    fn validate_params(&self, params: &Value, entity: Option<&EntityDefinition>) -> Result<()> {
        let field = params
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidDefinition("set_field requires a 'field'".to_string()))?;

        if let Some(entity) = entity {
            let dynamic = field.starts_with("$.") || has_placeholders(field);
            if !dynamic && !entity.fields.is_empty() && !entity.has_field(field) {
                return Err(Error::InvalidDefinition(format!(
                    "entity '{}' has no field '{}'",
                    entity.entity_type, field
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, params: &Value, _context: &Value) -> Result<ActionResult> {
        let field = params
            .get("field")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::Execution("No field specified for set_field action".to_string()))?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);

        Ok(ActionResult::output(json!({"field": field, "value": value.clone()}))
            .with_update(&format!("entity.{}", field), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldSpec, FieldType};

    #[tokio::test]
    async fn updates_entity_path() {
        let result = SetFieldAction
            .execute(&json!({"field": "status", "value": "Active"}), &json!({}))
            .await
            .unwrap();
        assert_eq!(result.context_updates["entity.status"], json!("Active"));
    }

    #[test]
    fn unknown_fields_fail_validation_for_registered_entities() {
        let officer = EntityDefinition::new("officer", "Officer")
            .with_field("status", FieldSpec::optional(FieldType::String));
        assert!(SetFieldAction
            .validate_params(&json!({"field": "status"}), Some(&officer))
            .is_ok());
        assert!(SetFieldAction
            .validate_params(&json!({"field": "colour"}), Some(&officer))
            .is_err());
        assert!(SetFieldAction
            .validate_params(&json!({"field": "colour"}), None)
            .is_ok());
    }
}
