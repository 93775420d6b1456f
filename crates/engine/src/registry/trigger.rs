use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON type a payload or entity field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Date,
    Any,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Date => value
                .as_str()
                .map(|s| crate::conditions::parse_datetime(s).is_some())
                .unwrap_or(false),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FieldSpec {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            label: None,
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            label: None,
        }
    }
}

/// An event that can start workflows, together with the payload it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub event: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "payloadSchema")]
    pub payload_schema: BTreeMap<String, FieldSpec>,
}

impl TriggerDefinition {
    pub fn new(event: &str, label: &str) -> Self {
        Self {
            event: event.to_string(),
            label: label.to_string(),
            description: String::new(),
            payload_schema: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.payload_schema.insert(name.to_string(), spec);
        self
    }

    /// Checks required fields and declared types. Undeclared fields pass through.
    pub fn validate_payload(&self, payload: &Value) -> std::result::Result<(), String> {
        let Some(object) = payload.as_object() else {
            if self.payload_schema.is_empty() {
                return Ok(());
            }
            return Err("payload must be a JSON object".to_string());
        };

        for (name, spec) in &self.payload_schema {
            match object.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field '{}'", name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.field_type.accepts(value) => {
                    return Err(format!(
                        "field '{}' must be of type {:?}",
                        name, spec.field_type
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hire_requested() -> TriggerDefinition {
        TriggerDefinition::new("Officers.HireRequested", "Officer hire requested")
            .with_field("officeId", FieldSpec::required(FieldType::Integer))
            .with_field("memberId", FieldSpec::required(FieldType::Integer))
            .with_field("startOn", FieldSpec::optional(FieldType::Date))
    }

    #[test]
    fn payload_with_required_fields_passes() {
        let trigger = hire_requested();
        assert!(trigger
            .validate_payload(&json!({"officeId": 3, "memberId": 11, "extra": "kept"}))
            .is_ok());
    }

    #[test]
    fn missing_or_mistyped_fields_are_reported() {
        let trigger = hire_requested();
        let err = trigger.validate_payload(&json!({"officeId": 3})).unwrap_err();
        assert!(err.contains("memberId"));

        let err = trigger
            .validate_payload(&json!({"officeId": "three", "memberId": 1}))
            .unwrap_err();
        assert!(err.contains("officeId"));

        let err = trigger
            .validate_payload(&json!({"officeId": 3, "memberId": 1, "startOn": "soon"}))
            .unwrap_err();
        assert!(err.contains("startOn"));
    }
}
