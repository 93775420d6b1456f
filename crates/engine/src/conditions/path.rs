use serde_json::{Map, Value};

static NULL: Value = Value::Null;

/// Looks up a dot path (`a.b.0.c`, optionally prefixed with `$.`).
///
/// Missing segments yield `null`, never an error.
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> &'a Value {
    let path = path.trim();
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() || path == "$" {
        return context;
    }

    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None => return &NULL,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(value) => value,
                None => return &NULL,
            },
            _ => return &NULL,
        };
    }
    current
}

/// Like [`resolve_path`], retrying under `entity.` when the root lookup is null.
pub fn resolve_with_entity_fallback<'a>(context: &'a Value, path: &str) -> &'a Value {
    let value = resolve_path(context, path);
    if !value.is_null() {
        return value;
    }
    let path = path.trim();
    let path = path.strip_prefix("$.").unwrap_or(path);
    resolve_path(context, &format!("entity.{}", path))
}

/// Writes `value` at a dot path, creating (or replacing non-object) intermediate nodes.
pub fn set_path(context: &mut Value, path: &str, value: Value) {
    let path = path.trim();
    let path = path.strip_prefix("$.").unwrap_or(path);
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = context;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_objects_arrays_and_prefix() {
        let context = json!({"trigger": {"officer": {"id": 9}}, "items": [{"name": "a"}]});
        assert_eq!(resolve_path(&context, "$.trigger.officer.id"), &json!(9));
        assert_eq!(resolve_path(&context, "items.0.name"), &json!("a"));
        assert!(resolve_path(&context, "trigger.missing.deeper").is_null());
        assert!(resolve_path(&context, "items.7").is_null());
    }

    #[test]
    fn entity_fallback_applies_only_when_root_is_null() {
        let context = json!({"status": "root", "entity": {"status": "nested", "level": 3}});
        assert_eq!(resolve_with_entity_fallback(&context, "status"), &json!("root"));
        assert_eq!(resolve_with_entity_fallback(&context, "level"), &json!(3));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut context = json!({"a": 1});
        set_path(&mut context, "a.b.c", json!(true));
        set_path(&mut context, "$.x.y", json!("z"));
        assert_eq!(context, json!({"a": {"b": {"c": true}}, "x": {"y": "z"}}));
    }
}
