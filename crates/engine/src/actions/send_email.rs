use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::approval::{Notification, Notifier};
use crate::registry::{Action, ActionResult, EntityDefinition};
use crate::template::render_template;
use crate::{Error, Result};

/// Renders a message with Tera and hands it to the configured [`Notifier`].
pub struct SendEmailAction {
    notifier: Arc<dyn Notifier>,
}

impl SendEmailAction {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

fn recipients(params: &Value) -> Vec<String> {
    match params.get("to") {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::Number(n)) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

/// Template variables are the context with `vars` layered on top.
fn template_context(context: &Value, params: &Value) -> Value {
    let mut merged = match context {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(vars)) = params.get("vars") {
        for (key, value) in vars {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[async_trait]
impl Action for SendEmailAction {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Sends a templated notification"
    }

    fn input_schema(&self) -> Value {
        json!({
            "to": {"type": "string|array", "required": true},
            "subject": {"type": "string", "required": true},
            "body": {"type": "string"},
            "template": {"type": "string"},
            "vars": {"type": "object"},
        })
    }

    fn validate_params(&self, params: &Value, _entity: Option<&EntityDefinition>) -> Result<()> {
        if params.get("to").is_none() {
            return Err(Error::InvalidDefinition("send_email requires 'to'".to_string()));
        }
        if params.get("body").is_none() && params.get("template").is_none() {
            return Err(Error::InvalidDefinition(
                "send_email requires a 'body' or 'template'".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, params: &Value, context: &Value) -> Result<ActionResult> {
        let to = recipients(params);
        if to.is_empty() {
            return Err(Error::Execution("send_email has no recipients".to_string()));
        }

        let variables = template_context(context, params);
        let subject = render_template(
            params.get("subject").and_then(Value::as_str).unwrap_or_default(),
            &variables,
        )?;
        let body_source = params
            .get("body")
            .or_else(|| params.get("template"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = render_template(body_source, &variables)?;

        let notification = Notification {
            recipients: to.clone(),
            subject: subject.clone(),
            body,
            metadata: json!({
                "mailer": params.get("mailer").cloned().unwrap_or(Value::Null),
                "method": params.get("method").cloned().unwrap_or(Value::Null),
            }),
        };
        debug!("Sending notification '{}' to {} recipient(s)", subject, to.len());
        self.notifier.notify(&notification).await?;

        Ok(ActionResult::output(json!({
            "to": to,
            "subject": subject,
            "delivered": true,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MockNotifier;

    #[tokio::test]
    async fn renders_subject_and_body_with_vars() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n: &Notification| {
                n.recipients == vec!["herald@example.org".to_string()]
                    && n.subject == "Warrant for Avery"
                    && n.body == "Term: 365 days"
            })
            .times(1)
            .returning(|_| Ok(()));

        let action = SendEmailAction::new(Arc::new(notifier));
        let result = action
            .execute(
                &json!({
                    "to": "herald@example.org",
                    "subject": "Warrant for {{ entity.name }}",
                    "body": "Term: {{ days }} days",
                    "vars": {"days": 365},
                }),
                &json!({"entity": {"name": "Avery"}}),
            )
            .await
            .unwrap();
        assert_eq!(result.output["delivered"], json!(true));
    }

    #[tokio::test]
    async fn delivery_errors_propagate() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_| Err(Error::Execution("smtp unavailable".to_string())));

        let action = SendEmailAction::new(Arc::new(notifier));
        let err = action
            .execute(&json!({"to": ["a@b.org"], "subject": "x", "body": "y"}), &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn requires_recipients_and_body() {
        let action = SendEmailAction::new(Arc::new(MockNotifier::new()));
        assert!(action.validate_params(&json!({"subject": "x"}), None).is_err());
        assert!(action.validate_params(&json!({"to": "a@b.org"}), None).is_err());
        assert!(action
            .validate_params(&json!({"to": "a@b.org", "template": "hi"}), None)
            .is_ok());
    }
}
