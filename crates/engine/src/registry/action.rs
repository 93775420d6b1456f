use async_trait::async_trait;
use serde_json::{Map, Value};

use super::EntityDefinition;
use crate::Result;

/// What an action hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    /// Stored under `context.nodes[<node id>].result` and in the execution log.
    pub output: Value,
    /// Merged into the top level of the instance context.
    pub context_updates: Map<String, Value>,
}

impl ActionResult {
    pub fn output(output: Value) -> Self {
        Self {
            output,
            context_updates: Map::new(),
        }
    }

    pub fn with_update(mut self, key: &str, value: Value) -> Self {
        self.context_updates.insert(key.to_string(), value);
        self
    }
}

/// A named side-effecting step. Implementations must tolerate being retried.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Async actions are queued and finished out of band by the resume task.
    fn is_async(&self) -> bool {
        false
    }

    fn input_schema(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Static checks run when a graph is compiled. `entity` is the definition's entity
    /// schema when one is registered.
    fn validate_params(&self, _params: &Value, _entity: Option<&EntityDefinition>) -> Result<()> {
        Ok(())
    }

    /// `params` are already resolved against `context`.
    async fn execute(&self, params: &Value, context: &Value) -> Result<ActionResult>;
}
