use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};

use super::compare::{as_number, compare};
use super::path::{resolve_path, resolve_with_entity_fallback};
use crate::registry::Condition;

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Strings parse as dates, numbers as unix seconds.
pub fn value_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// `"30m"`, `"24h"`, `"14d"`, `"45s"` or a plain number of seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<i64>() {
        return Some(Duration::seconds(secs));
    }
    let unit_start = input.char_indices().last().map(|(i, _)| i)?;
    let (amount, unit) = input.split_at(unit_start);
    let amount = amount.trim().parse::<i64>().ok()?;
    match unit.to_ascii_lowercase().as_str() {
        "s" => Some(Duration::seconds(amount)),
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        "w" => Some(Duration::weeks(amount)),
        _ => None,
    }
}

/// `state_duration` (time spent in the current state) and `field_date` checks.
pub struct TimeCondition;

impl TimeCondition {
    fn state_duration(params: &Value, context: &Value) -> bool {
        let Some(entered_at) = value_to_datetime(resolve_path(context, "state_entered_at")) else {
            return false;
        };
        let elapsed = (Utc::now() - entered_at).num_milliseconds() as f64 / 1000.0;
        let divisor = match params.get("unit").and_then(Value::as_str).unwrap_or("hours") {
            "seconds" => 1.0,
            "minutes" => 60.0,
            "days" => 86_400.0,
            _ => 3_600.0,
        };
        let operator = params.get("operator").and_then(Value::as_str).unwrap_or("gt");
        let Some(threshold) = params.get("value").and_then(as_number) else {
            return false;
        };
        compare(&json!(elapsed / divisor), operator, &json!(threshold))
    }

    fn field_date(params: &Value, context: &Value) -> bool {
        let Some(field) = params.get("field").and_then(Value::as_str) else {
            return false;
        };
        let Some(field_date) = value_to_datetime(resolve_with_entity_fallback(context, field)) else {
            return false;
        };
        let compare_date = match params.get("value") {
            None | Some(Value::Null) => Utc::now(),
            Some(Value::String(s)) if s == "now" => Utc::now(),
            Some(other) => match value_to_datetime(other) {
                Some(dt) => dt,
                None => return false,
            },
        };
        let operator = params.get("operator").and_then(Value::as_str).unwrap_or("lt");
        compare(
            &json!(field_date.timestamp()),
            operator,
            &json!(compare_date.timestamp()),
        )
    }
}

impl Condition for TimeCondition {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Evaluates time spent in the current state or compares a date field"
    }

    fn params_schema(&self) -> Value {
        json!({
            "time": {"type": "string", "required": true, "enum": ["state_duration", "field_date"]},
            "operator": {"type": "string", "required": true, "enum": ["eq", "neq", "gt", "gte", "lt", "lte"]},
            "value": {"type": "mixed", "required": true},
            "unit": {"type": "string", "enum": ["seconds", "minutes", "hours", "days"]},
            "field": {"type": "string"},
        })
    }

    fn evaluate(&self, params: &Value, context: &Value) -> bool {
        match params.get("time").and_then(Value::as_str) {
            Some("state_duration") => Self::state_duration(params, context),
            Some("field_date") => Self::field_date(params, context),
            _ => false,
        }
    }
}
