use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::Result;

/// A rendered message handed to whatever delivers mail, chat or push notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            "Notification to [{}]: {}",
            notification.recipients.join(", "),
            notification.subject
        );
        Ok(())
    }
}
