use serde_json::{Map, Value};

/// A named, side-effect free predicate over the evaluation context.
pub trait Condition: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn params_schema(&self) -> Value {
        Value::Object(Map::new())
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool;
}
