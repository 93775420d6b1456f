use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::parse_duration;
use crate::store::{ApprovalStatus, ApprovalType, ApproverType, WorkflowApproval};
use crate::{Error, MemberId, Result};

/// Who may decide a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApproverRule {
    Static { member_ids: Vec<MemberId> },
    Permission { permission: String },
    Role { role: String },
    /// A resolver registered by a plugin, called with `config` and the instance context.
    Dynamic {
        resolver: String,
        #[serde(default)]
        config: Value,
    },
}

impl ApproverRule {
    pub fn approver_type(&self) -> ApproverType {
        match self {
            ApproverRule::Static { .. } => ApproverType::Static,
            ApproverRule::Permission { .. } => ApproverType::Permission,
            ApproverRule::Role { .. } => ApproverType::Role,
            ApproverRule::Dynamic { .. } => ApproverType::Dynamic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThresholdConfig {
    Fixed { count: u32 },
    /// Percentage of the resolved pool, rounded up.
    Percentage { percent: f64 },
}

impl ThresholdConfig {
    pub fn count_for(&self, pool_size: usize) -> usize {
        match self {
            ThresholdConfig::Fixed { count } => *count as usize,
            ThresholdConfig::Percentage { percent } => {
                (percent.clamp(0.0, 100.0) / 100.0 * pool_size as f64).ceil() as usize
            }
        }
    }
}

/// What the deadline scanner does with an overdue gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EscalationConfig {
    AutoApprove,
    AutoReject,
    /// Replace the approver pool and extend the deadline; the gate stays pending.
    Reassign {
        #[serde(default, alias = "approver_rule")]
        approver: Option<ApproverRule>,
        #[serde(default)]
        extend_hours: Option<f64>,
    },
    /// Send a notification, then expire.
    Notify {
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Expire,
}

impl EscalationConfig {
    /// Absent config or a config without an `action` expires the gate.
    pub fn decode(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(EscalationConfig::Expire),
            Value::Object(map) if !map.contains_key("action") => Ok(EscalationConfig::Expire),
            other => serde_json::from_value(other.clone())
                .map_err(|e| Error::InvalidDefinition(format!("invalid escalation config: {}", e))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EscalationConfig::AutoApprove => "auto_approve",
            EscalationConfig::AutoReject => "auto_reject",
            EscalationConfig::Reassign { .. } => "reassign",
            EscalationConfig::Notify { .. } => "notify",
            EscalationConfig::Expire => "expire",
        }
    }
}

fn approved_port() -> String {
    "approved".to_string()
}

fn rejected_port() -> String {
    "rejected".to_string()
}

fn expired_port() -> String {
    "expired".to_string()
}

/// `config` of an approval node.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalGateConfig {
    #[serde(default)]
    pub approval_type: ApprovalType,
    #[serde(alias = "approver_rule")]
    pub approver: ApproverRule,
    #[serde(default)]
    pub required_count: Option<u32>,
    #[serde(default, alias = "threshold_config")]
    pub threshold: Option<ThresholdConfig>,
    #[serde(default)]
    pub timeout_hours: Option<f64>,
    /// Duration string such as `"14d"`; used when `timeout_hours` is absent.
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default, alias = "escalation_config")]
    pub escalation: Option<Value>,
    #[serde(default)]
    pub allow_delegation: bool,
    #[serde(default = "approved_port")]
    pub on_satisfied_port: String,
    #[serde(default = "rejected_port")]
    pub on_denied_port: String,
    #[serde(default = "expired_port")]
    pub timeout_port: String,
}

impl ApprovalGateConfig {
    pub fn from_node_config(config: &Value) -> Result<Self> {
        let gate: ApprovalGateConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::InvalidDefinition(format!("invalid approval config: {}", e)))?;
        gate.escalation()?;
        if let Some(deadline) = &gate.deadline {
            if gate.timeout_hours.is_none() && parse_duration(deadline).is_none() {
                return Err(Error::InvalidDefinition(format!("invalid approval deadline '{}'", deadline)));
            }
        }
        Ok(gate)
    }

    pub fn escalation(&self) -> Result<Option<EscalationConfig>> {
        self.escalation.as_ref().map(EscalationConfig::decode).transpose()
    }

    /// Approvals needed, clamped to `[1, pool size]`.
    pub fn required_count(&self, pool_size: usize) -> usize {
        let wanted = match self.approval_type {
            ApprovalType::Unanimous => pool_size,
            ApprovalType::AnyOne => 1,
            ApprovalType::Threshold | ApprovalType::Chain => match (&self.threshold, self.required_count) {
                (Some(threshold), _) => threshold.count_for(pool_size),
                (None, Some(count)) => count as usize,
                (None, None) if self.approval_type == ApprovalType::Chain => pool_size,
                (None, None) => 1,
            },
        };
        wanted.clamp(1, pool_size.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        match (self.timeout_hours, &self.deadline) {
            (Some(hours), _) => Some(hours_to_duration(hours)),
            (None, Some(deadline)) => parse_duration(deadline),
            (None, None) => None,
        }
    }

    pub fn deadline_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.timeout().map(|timeout| now + timeout)
    }

    pub fn settings(&self) -> GateSettings {
        GateSettings {
            on_satisfied_port: self.on_satisfied_port.clone(),
            on_denied_port: self.on_denied_port.clone(),
            timeout_port: self.timeout_port.clone(),
            allow_delegation: self.allow_delegation,
            timeout_hours: self.timeout().map(|t| t.num_seconds() as f64 / 3600.0),
        }
    }
}

pub(crate) fn hours_to_duration(hours: f64) -> Duration {
    Duration::seconds((hours * 3600.0).round() as i64)
}

/// Gate settings persisted with an approval so it can be resolved without the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "approved_port")]
    pub on_satisfied_port: String,
    #[serde(default = "rejected_port")]
    pub on_denied_port: String,
    #[serde(default = "expired_port")]
    pub timeout_port: String,
    #[serde(default)]
    pub allow_delegation: bool,
    #[serde(default)]
    pub timeout_hours: Option<f64>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            on_satisfied_port: approved_port(),
            on_denied_port: rejected_port(),
            timeout_port: expired_port(),
            allow_delegation: false,
            timeout_hours: None,
        }
    }
}

impl GateSettings {
    pub fn from_approval(approval: &WorkflowApproval) -> Self {
        serde_json::from_value(approval.gate_config.clone()).unwrap_or_default()
    }

    /// Output port for a resolved status; `None` while pending or after cancellation.
    pub fn port_for(&self, status: ApprovalStatus) -> Option<String> {
        match status {
            ApprovalStatus::Approved => Some(self.on_satisfied_port.clone()),
            ApprovalStatus::Rejected => Some(self.on_denied_port.clone()),
            ApprovalStatus::Expired => Some(self.timeout_port.clone()),
            ApprovalStatus::Pending | ApprovalStatus::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub approver_id: MemberId,
    pub responded_at: DateTime<Utc>,
    #[serde(default)]
    pub next_picked: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub from: MemberId,
    pub to: MemberId,
    pub delegated_at: DateTime<Utc>,
}

/// Persisted `approver_config`: the rule plus chain and delegation progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproverConfig {
    pub rule: ApproverRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_approver_id: Option<MemberId>,
    #[serde(default)]
    pub approval_chain: Vec<ChainStep>,
    #[serde(default)]
    pub delegations: Vec<Delegation>,
}

impl ApproverConfig {
    pub fn new(rule: ApproverRule) -> Self {
        Self {
            rule,
            current_approver_id: None,
            approval_chain: Vec::new(),
            delegations: Vec::new(),
        }
    }

    pub fn from_approval(approval: &WorkflowApproval) -> Result<Self> {
        serde_json::from_value(approval.approver_config.clone()).map_err(|e| {
            Error::Internal(format!("approval {} has an unreadable approver config: {}", approval.id, e))
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tagged_gate_config() {
        let gate = ApprovalGateConfig::from_node_config(&json!({
            "approval_type": "threshold",
            "approver": {"type": "permission", "permission": "Warrants.approve"},
            "threshold": {"type": "percentage", "percent": 50},
            "deadline": "14d",
            "escalation": {"action": "auto_approve"},
        }))
        .unwrap();

        assert_eq!(gate.approver.approver_type(), ApproverType::Permission);
        assert_eq!(gate.required_count(3), 2);
        assert_eq!(gate.timeout(), Some(Duration::days(14)));
        assert_eq!(gate.escalation().unwrap(), Some(EscalationConfig::AutoApprove));
        assert_eq!(gate.settings().on_satisfied_port, "approved");
    }

    #[test]
    fn required_count_follows_approval_type() {
        let mut gate = ApprovalGateConfig::from_node_config(&json!({
            "approver": {"type": "static", "member_ids": [1, 2, 3]},
            "required_count": 7,
        }))
        .unwrap();
        assert_eq!(gate.required_count(3), 3);

        gate.approval_type = ApprovalType::AnyOne;
        assert_eq!(gate.required_count(3), 1);
        gate.approval_type = ApprovalType::Unanimous;
        assert_eq!(gate.required_count(3), 3);
        gate.approval_type = ApprovalType::Chain;
        gate.required_count = None;
        assert_eq!(gate.required_count(4), 4);
        assert_eq!(gate.required_count(0), 1);
    }

    #[test]
    fn unknown_or_missing_escalation_expires() {
        assert_eq!(
            EscalationConfig::decode(&json!({"action": "summon_the_herald"})).unwrap(),
            EscalationConfig::Expire
        );
        assert_eq!(EscalationConfig::decode(&json!({"notes": "x"})).unwrap(), EscalationConfig::Expire);
        assert_eq!(
            EscalationConfig::decode(&json!({"action": "reassign", "extend_hours": 48})).unwrap(),
            EscalationConfig::Reassign {
                approver: None,
                extend_hours: Some(48.0)
            }
        );
    }

    #[test]
    fn rejects_malformed_config() {
        assert!(ApprovalGateConfig::from_node_config(&json!({"approver": {"type": "nobody"}})).is_err());
        assert!(ApprovalGateConfig::from_node_config(&json!({
            "approver": {"type": "role", "role": "Crown"},
            "deadline": "soon",
        }))
        .is_err());
    }
}
