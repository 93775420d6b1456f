use serde_json::Value;

use super::compare::{compare, is_truthy};
use super::path::resolve_path;

const OPERATORS: [&str; 6] = [">=", "<=", "!=", "==", ">", "<"];

/// Evaluates `"path op literal"` or, without an operator, the truthiness of `path`.
pub fn evaluate_expression(expression: &str, context: &Value) -> bool {
    let expression = expression.trim();
    if expression.is_empty() {
        return false;
    }

    for operator in OPERATORS {
        if let Some((left, right)) = expression.split_once(operator) {
            let actual = resolve_path(context, left.trim());
            let literal = right.trim().trim_matches(|c| c == '"' || c == '\'');
            let expected = match literal {
                "null" => Value::Null,
                _ => Value::String(literal.to_string()),
            };
            return compare(actual, operator, &expected);
        }
    }

    is_truthy(resolve_path(context, expression))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn comparisons_and_truthiness() {
        let context = json!({
            "trigger": {"requiresWarrant": true, "count": 4, "status": "open"},
            "nodes": {},
        });

        assert!(evaluate_expression("trigger.requiresWarrant", &context));
        assert!(evaluate_expression("$.trigger.requiresWarrant == true", &context));
        assert!(evaluate_expression("trigger.count >= 4", &context));
        assert!(!evaluate_expression("trigger.count > 4", &context));
        assert!(evaluate_expression("trigger.status != 'closed'", &context));
        assert!(!evaluate_expression("trigger.missing", &context));
        assert!(evaluate_expression("trigger.missing == null", &context));
        assert!(!evaluate_expression("", &context));
    }
}
