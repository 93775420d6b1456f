use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::conditions::resolve_path;
use crate::template::{has_placeholders, interpolate};

const DESCRIPTOR_KEYS: [&str; 5] = ["type", "value", "path", "key", "default"];

/// Resolves node parameters against the instance context.
///
/// Handles `$.path` strings, `{type: fixed|context|app_setting}` descriptors and `{{...}}`
/// interpolation, recursing through objects and arrays.
pub fn resolve_params(value: &Value, context: &Value, settings: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) if s.starts_with("$.") => resolve_path(context, s).clone(),
        Value::String(s) if has_placeholders(s) => interpolate(s, context, settings),
        Value::Object(map) => match descriptor(map, context, settings) {
            Some(resolved) => resolved,
            None => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), resolve_params(v, context, settings)))
                    .collect::<Map<String, Value>>(),
            ),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_params(item, context, settings))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn descriptor(
    map: &Map<String, Value>,
    context: &Value,
    settings: &HashMap<String, String>,
) -> Option<Value> {
    let kind = map.get("type")?.as_str()?;
    if !map.keys().all(|k| DESCRIPTOR_KEYS.contains(&k.as_str())) {
        return None;
    }
    let default = map.get("default").cloned().unwrap_or(Value::Null);

    let resolved = match kind {
        "fixed" => map.get("value").cloned().unwrap_or(Value::Null),
        "context" => map
            .get("path")
            .and_then(Value::as_str)
            .map(|path| resolve_path(context, path).clone())
            .unwrap_or(Value::Null),
        "app_setting" => map
            .get("key")
            .and_then(Value::as_str)
            .and_then(|key| settings.get(key))
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        _ => return None,
    };

    Some(if resolved.is_null() { default } else { resolved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_paths_descriptors_and_templates() {
        let context = json!({"trigger": {"officer": {"id": 9, "email": "a@b.org"}}});
        let mut settings = HashMap::new();
        settings.insert("warrant_days".to_string(), "365".to_string());

        let params = json!({
            "officerId": "$.trigger.officer.id",
            "days": {"type": "app_setting", "key": "warrant_days"},
            "fallback": {"type": "context", "path": "trigger.absent", "default": 1},
            "fixed": {"type": "fixed", "value": [1, 2]},
            "subject": "Officer {{trigger.officer.id}}",
            "nested": [{"to": "{{trigger.officer.email}}"}],
            "payload": {"type": "officer", "extra": "$.trigger.officer.id"},
        });

        let resolved = resolve_params(&params, &context, &settings);
        assert_eq!(resolved["officerId"], json!(9));
        assert_eq!(resolved["days"], json!("365"));
        assert_eq!(resolved["fallback"], json!(1));
        assert_eq!(resolved["fixed"], json!([1, 2]));
        assert_eq!(resolved["subject"], json!("Officer 9"));
        assert_eq!(resolved["nested"][0]["to"], json!("a@b.org"));
        // objects with other keys are data, not descriptors
        assert_eq!(resolved["payload"], json!({"type": "officer", "extra": 9}));
    }
}
