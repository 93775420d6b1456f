//! Condition rules and the core condition types.
//!
//! A rule is decoded once from its JSON form into [`ConditionRule`] and evaluated against an
//! evaluation context. Evaluation never fails: unknown types and missing data yield `false`.

mod access;
mod approval_gate;
pub mod compare;
mod expression;
mod field;
mod ownership;
mod path;
mod time;
mod workflow_context;

pub use access::{PermissionCondition, RoleCondition};
pub use approval_gate::ApprovalGateCondition;
pub use expression::evaluate_expression;
pub use field::FieldCondition;
pub use ownership::OwnershipCondition;
pub use path::{resolve_path, resolve_with_entity_fallback, set_path};
pub use time::{parse_datetime, parse_duration, value_to_datetime, TimeCondition};
pub use workflow_context::WorkflowContextCondition;

use serde_json::Value;
use tracing::warn;

use crate::registry::Registry;
use crate::{Error, Result};

/// Keys that identify a condition type when no explicit `type` is given, in priority order.
const MARKER_KEYS: [&str; 7] = [
    "permission",
    "role",
    "field",
    "ownership",
    "approval_gate",
    "time",
    "workflow_context",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionRule {
    All(Vec<ConditionRule>),
    Any(Vec<ConditionRule>),
    Not(Box<ConditionRule>),
    Literal(bool),
    /// `"path op value"` or a bare path.
    Expression(String),
    /// A registered condition type with its raw parameters.
    Check { kind: String, params: Value },
}

fn invalid(message: String) -> Error {
    Error::InvalidDefinition(message)
}

fn parse_list(value: &Value) -> Result<Vec<ConditionRule>> {
    match value {
        Value::Array(items) => items.iter().map(ConditionRule::parse).collect(),
        other => Ok(vec![ConditionRule::parse(other)?]),
    }
}

impl ConditionRule {
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(ConditionRule::Literal(true)),
            Value::Bool(b) => Ok(ConditionRule::Literal(*b)),
            Value::String(s) if s.trim().is_empty() => Ok(ConditionRule::Literal(true)),
            Value::String(s) => Ok(ConditionRule::Expression(s.trim().to_string())),
            Value::Array(_) => Ok(ConditionRule::All(parse_list(value)?)),
            Value::Number(n) => Err(invalid(format!("condition cannot be a number ({})", n))),
            Value::Object(map) => {
                if let Some(items) = map.get("all") {
                    return Ok(ConditionRule::All(parse_list(items)?));
                }
                if let Some(items) = map.get("any") {
                    return Ok(ConditionRule::Any(parse_list(items)?));
                }
                if let Some(inner) = map.get("not") {
                    return Ok(ConditionRule::Not(Box::new(ConditionRule::parse(inner)?)));
                }

                if let Some(kind) = map.get("type") {
                    let kind = kind
                        .as_str()
                        .ok_or_else(|| invalid("condition 'type' must be a string".to_string()))?;
                    let conditions = map.get("conditions").unwrap_or(&Value::Null);
                    return match kind {
                        "all" => Ok(ConditionRule::All(parse_list(conditions)?)),
                        "any" => Ok(ConditionRule::Any(parse_list(conditions)?)),
                        "not" => Ok(ConditionRule::Not(Box::new(ConditionRule::parse(
                            map.get("condition").unwrap_or(&Value::Null),
                        )?))),
                        "expression" => Ok(ConditionRule::Expression(
                            map.get("expression")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .trim()
                                .to_string(),
                        )),
                        "always" => Ok(ConditionRule::Literal(true)),
                        "never" => Ok(ConditionRule::Literal(false)),
                        _ => Ok(ConditionRule::Check {
                            kind: kind.to_string(),
                            params: value.clone(),
                        }),
                    };
                }

                if let Some(kind) = MARKER_KEYS.iter().find(|key| map.contains_key(**key)) {
                    return Ok(ConditionRule::Check {
                        kind: kind.to_string(),
                        params: value.clone(),
                    });
                }

                if let Some(expression) = map.get("expression").and_then(Value::as_str) {
                    return Ok(ConditionRule::Expression(expression.trim().to_string()));
                }

                Err(invalid(format!("cannot determine condition type of {}", value)))
            }
        }
    }

    /// Registered condition types this rule depends on.
    pub fn referenced_kinds(&self) -> Vec<&str> {
        let mut kinds = Vec::new();
        self.collect_kinds(&mut kinds);
        kinds
    }

    fn collect_kinds<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ConditionRule::All(rules) | ConditionRule::Any(rules) => {
                rules.iter().for_each(|rule| rule.collect_kinds(out))
            }
            ConditionRule::Not(rule) => rule.collect_kinds(out),
            ConditionRule::Check { kind, .. } => out.push(kind.as_str()),
            ConditionRule::Literal(_) | ConditionRule::Expression(_) => {}
        }
    }

    pub fn evaluate(&self, registry: &Registry, context: &Value) -> bool {
        match self {
            ConditionRule::All(rules) => rules.iter().all(|rule| rule.evaluate(registry, context)),
            ConditionRule::Any(rules) => rules.iter().any(|rule| rule.evaluate(registry, context)),
            ConditionRule::Not(rule) => !rule.evaluate(registry, context),
            ConditionRule::Literal(value) => *value,
            ConditionRule::Expression(expression) => evaluate_expression(expression, context),
            ConditionRule::Check { kind, params } => match registry.condition(kind) {
                Some(condition) => condition.evaluate(params, context),
                None => {
                    warn!("Unknown condition type '{}', treating as false", kind);
                    false
                }
            },
        }
    }
}

/// AND over an ordered list; an empty list passes.
pub fn all_pass(rules: &[ConditionRule], registry: &Registry, context: &Value) -> bool {
    rules.iter().all(|rule| rule.evaluate(registry, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::LogNotifier;
    use crate::registry::CorePlugin;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier))]).unwrap()
    }

    #[test]
    fn detects_type_from_marker_keys() {
        let rule = ConditionRule::parse(&json!({"permission": "Officers.hire"})).unwrap();
        assert_eq!(rule.referenced_kinds(), vec!["permission"]);

        let rule = ConditionRule::parse(&json!({"type": "custom_check", "x": 1})).unwrap();
        assert_eq!(rule.referenced_kinds(), vec!["custom_check"]);

        assert!(ConditionRule::parse(&json!({"unknown": 1})).is_err());
        assert!(ConditionRule::parse(&json!(3)).is_err());
    }

    #[test]
    fn composes_all_any_not() {
        let registry = registry();
        let context = json!({
            "user_roles": ["Crown"],
            "entity": {"level": 2},
        });
        let rule = ConditionRule::parse(&json!({
            "all": [
                {"role": "Crown"},
                {"any": [
                    {"field": "level", "operator": "gt", "value": 5},
                    {"not": {"field": "level", "operator": "eq", "value": 3}},
                ]},
                "entity.level >= 2",
            ]
        }))
        .unwrap();
        assert!(rule.evaluate(&registry, &context));

        let rule = ConditionRule::parse(&json!({"type": "not", "condition": {"role": "Crown"}})).unwrap();
        assert!(!rule.evaluate(&registry, &context));
    }

    #[test]
    fn unknown_kinds_fail_closed() {
        let registry = registry();
        let rule = ConditionRule::parse(&json!({"type": "nobody_registered_this"})).unwrap();
        assert!(!rule.evaluate(&registry, &json!({})));
        assert!(all_pass(&[], &registry, &json!({})));
    }
}
