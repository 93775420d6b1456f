use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::registry::{Action, ActionResult, EntityDefinition};
use crate::template::has_placeholders;
use crate::{Error, Result};

/// Calls an external HTTP endpoint with a JSON body.
pub struct WebhookAction {
    client: Client,
    timeout: Duration,
}

impl WebhookAction {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for WebhookAction {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_method(params: &Value) -> Result<Method> {
    match params
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("POST")
        .to_uppercase()
        .as_str()
    {
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "GET" => Ok(Method::GET),
        other => Err(Error::Execution(format!("Unsupported webhook method: {}", other))),
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::Execution(format!("Invalid webhook URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::Execution(format!("Unsupported webhook scheme: {}", scheme))),
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn name(&self) -> &str {
        "webhook"
    }

    fn description(&self) -> &str {
        "Sends a JSON request to an external URL"
    }

    fn input_schema(&self) -> Value {
        json!({
            "url": {"type": "string", "required": true},
            "method": {"type": "string", "enum": ["POST", "PUT", "GET"]},
            "headers": {"type": "object"},
            "body": {"type": "mixed"},
        })
    }

    fn validate_params(&self, params: &Value, _entity: Option<&EntityDefinition>) -> Result<()> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidDefinition("webhook requires a 'url'".to_string()))?;
        parse_method(params).map_err(|e| Error::InvalidDefinition(e.to_string()))?;
        // URLs built from context are only checked at execution time
        if !url.starts_with("$.") && !has_placeholders(url) {
            parse_url(url).map_err(|e| Error::InvalidDefinition(e.to_string()))?;
        }
        Ok(())
    }

    async fn execute(&self, params: &Value, _context: &Value) -> Result<ActionResult> {
        let url = parse_url(params.get("url").and_then(Value::as_str).unwrap_or_default())?;
        let method = parse_method(params)?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .timeout(self.timeout);
        if let Some(Value::Object(headers)) = params.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        if method != Method::GET {
            request = request.json(params.get("body").unwrap_or(&Value::Null));
        }

        debug!("Calling webhook {} {}", method, url);
        let response = request
            .send()
            .await
            .map_err(|e| Error::Execution(format!("Webhook request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Webhook {} returned HTTP {}", url, status.as_u16());
            return Err(Error::Execution(format!(
                "Webhook {} returned HTTP {}: {}",
                url,
                status.as_u16(),
                text
            )));
        }

        Ok(ActionResult::output(json!({
            "status": status.as_u16(),
            "url": url.as_str(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_literal_urls_only() {
        let action = WebhookAction::new();
        assert!(action
            .validate_params(&json!({"url": "https://hooks.example.org/warrants"}), None)
            .is_ok());
        assert!(action.validate_params(&json!({"url": "not a url"}), None).is_err());
        assert!(action
            .validate_params(&json!({"url": "ftp://example.org/file"}), None)
            .is_err());
        assert!(action
            .validate_params(&json!({"url": "{{setting:hook_url}}"}), None)
            .is_ok());
        assert!(action
            .validate_params(&json!({"url": "https://a.org", "method": "DELETE"}), None)
            .is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let action = WebhookAction::new().with_timeout(Duration::from_millis(200));
        let err = action
            .execute(&json!({"url": "http://127.0.0.1:9/hook"}), &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
