//! Template rendering utilities using Tera
//!
//! Two flavours live here: full Tera rendering for message bodies, and the lighter
//! `{{path}}` interpolation used inside action parameters.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tera::{Context, Tera};

use crate::conditions::resolve_path;
use crate::{Error, Result};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid");
    static ref WHOLE_PLACEHOLDER: Regex =
        Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").expect("placeholder pattern is valid");
}

/// Render a Tera template string with the given context
pub fn render_template(template: &str, context: &Value) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("template", template)
        .map_err(|e| Error::Execution(format!("Failed to parse template: {}", e)))?;

    let mut tera_context = Context::new();
    match context {
        Value::Object(map) => {
            for (key, value) in map {
                tera_context.insert(key, &value);
            }
        }
        _ => {
            // If not an object, make it available as "data"
            tera_context.insert("data", &context);
        }
    }

    tera.render("template", &tera_context)
        .map_err(|e| Error::Execution(format!("Failed to render template: {}", e)))
}

/// Whether the string carries any `{{...}}` placeholder.
pub fn has_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

/// Interpolate `{{path}}`, `{{now}}` and `{{setting:key}}` placeholders.
///
/// A string that is exactly one placeholder keeps the JSON type of the resolved value;
/// otherwise every placeholder is substituted as text and a string is returned.
pub fn interpolate(template: &str, context: &Value, settings: &HashMap<String, String>) -> Value {
    if let Some(caps) = WHOLE_PLACEHOLDER.captures(template) {
        return lookup(&caps[1], context, settings);
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        match lookup(&caps[1], context, settings) {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

fn lookup(expr: &str, context: &Value, settings: &HashMap<String, String>) -> Value {
    if expr == "now" {
        return Value::String(Utc::now().to_rfc3339());
    }
    if let Some(key) = expr.strip_prefix("setting:") {
        return settings
            .get(key.trim())
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null);
    }
    resolve_path(context, expr).clone()
}
