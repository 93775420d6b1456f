//! Loose value comparison shared by the field, context and expression conditions.

use serde_json::Value;
use std::cmp::Ordering;

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Truthiness used by bare-path expressions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Equality with numeric-string and boolean coercion.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(b), other) | (other, Value::Bool(b)) => as_bool(other) == Some(*b),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) if !(left.is_string() && right.is_string()) => a == b,
            _ => left == right,
        },
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Applies a named operator. A null left-hand side only satisfies `eq null` and `neq`.
pub fn compare(left: &Value, operator: &str, right: &Value) -> bool {
    match operator {
        "eq" | "==" => loose_eq(left, right),
        "neq" | "!=" => !loose_eq(left, right),
        "gt" | ">" => ordering(left, right) == Some(Ordering::Greater),
        "gte" | ">=" => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        "lt" | "<" => ordering(left, right) == Some(Ordering::Less),
        "lte" | "<=" => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        "in" => !left.is_null()
            && right
                .as_array()
                .map(|items| items.iter().any(|item| loose_eq(left, item)))
                .unwrap_or(false),
        "not_in" => !left.is_null()
            && right
                .as_array()
                .map(|items| !items.iter().any(|item| loose_eq(left, item)))
                .unwrap_or(false),
        "contains" => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
            _ => false,
        },
        "starts_with" => match (left, right) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        "ends_with" => match (left, right) {
            (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_compare_as_numbers() {
        assert!(compare(&json!(5), ">=", &json!("5")));
        assert!(compare(&json!("10"), "gt", &json!(9)));
        assert!(loose_eq(&json!(true), &json!("true")));
        assert!(!loose_eq(&json!("01"), &json!("1")));
    }

    #[test]
    fn null_never_satisfies_ordering_or_membership() {
        assert!(!compare(&Value::Null, "gt", &json!(1)));
        assert!(!compare(&Value::Null, "in", &json!([null])));
        assert!(!compare(&Value::Null, "not_in", &json!([1])));
        assert!(compare(&Value::Null, "eq", &Value::Null));
    }

    #[test]
    fn string_operators() {
        assert!(compare(&json!("Baron of Bjornsborg"), "starts_with", &json!("Baron")));
        assert!(compare(&json!("Baron of Bjornsborg"), "ends_with", &json!("borg")));
        assert!(compare(&json!(["a", "b"]), "contains", &json!("b")));
        assert!(!compare(&json!(3), "contains", &json!("3")));
    }
}
