use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::{MemberId, Result};

/// Computes the eligible approvers of a `dynamic` approval gate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApproverResolver: Send + Sync {
    async fn resolve(&self, config: &Value, context: &Value) -> Result<Vec<MemberId>>;
}
