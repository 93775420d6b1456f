use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Error, MemberId};

/// Implements the lowercase string form used in storage for a unit enum.
macro_rules! storage_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text),)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Error::Validation(format!(
                        "Invalid {}: {}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

// Definitions and versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub entity_type: String,
    pub plugin_name: Option<String>,
    /// Highest version number created so far.
    pub version: i32,
    pub current_version_id: Option<Uuid>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: &str, slug: &str, entity_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: slug.to_string(),
            description: None,
            entity_type: entity_type.to_string(),
            plugin_name: None,
            version: 0,
            current_version_id: None,
            is_active: false,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub version_number: i32,
    /// Node/edge graph, see `workflow::GraphDefinition`.
    pub definition: JsonValue,
    /// UI-only, never read by the engine.
    pub canvas_layout: Option<JsonValue>,
    pub status: VersionStatus,
    pub change_notes: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<MemberId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Draft,
    Published,
    Archived,
}

storage_enum!(VersionStatus {
    Draft => "draft",
    Published => "published",
    Archived => "archived",
});

// Instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub version_id: Uuid,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub status: InstanceStatus,
    pub current_state_id: Option<String>,
    pub previous_state_id: Option<String>,
    /// Nodes the instance is parked at (more than one only after a fork).
    pub active_nodes: Vec<String>,
    pub context: JsonValue,
    pub triggered_by: Option<MemberId>,
    pub parent_instance_id: Option<Uuid>,
    pub parent_node_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn is_waiting_at(&self, node_id: &str) -> bool {
        self.status == InstanceStatus::Waiting && self.active_nodes.iter().any(|n| n == node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }
}

storage_enum!(InstanceStatus {
    Pending => "pending",
    Running => "running",
    Waiting => "waiting",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

// Approvals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowApproval {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub execution_log_id: Option<Uuid>,
    pub approval_type: ApprovalType,
    pub approver_type: ApproverType,
    /// Serialized `approval::ApproverConfig` (rule plus chain progress).
    pub approver_config: JsonValue,
    /// Eligible approvers resolved when the gate opened.
    pub approver_pool: Vec<MemberId>,
    pub required_count: i32,
    pub approved_count: i32,
    pub rejected_count: i32,
    pub abstained_count: i32,
    pub status: ApprovalStatus,
    /// Serialized `approval::GateSettings` (ports, delegation, timeout).
    pub gate_config: JsonValue,
    pub escalation_config: Option<JsonValue>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Threshold,
    Unanimous,
    AnyOne,
    Chain,
}

impl Default for ApprovalType {
    fn default() -> Self {
        ApprovalType::Threshold
    }
}

storage_enum!(ApprovalType {
    Threshold => "threshold",
    Unanimous => "unanimous",
    AnyOne => "any_one",
    Chain => "chain",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApproverType {
    Static,
    Permission,
    Role,
    Dynamic,
}

storage_enum!(ApproverType {
    Static => "static",
    Permission => "permission",
    Role => "role",
    Dynamic => "dynamic",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

storage_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Expired => "expired",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowApprovalResponse {
    pub id: Uuid,
    pub approval_id: Uuid,
    pub member_id: MemberId,
    pub decision: Decision,
    pub comment: Option<String>,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
    RequestChanges,
}

storage_enum!(Decision {
    Approve => "approve",
    Reject => "reject",
    Abstain => "abstain",
    RequestChanges => "request_changes",
});

// Audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionLog {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub attempt_number: i32,
    pub status: ExecutionStatus,
    pub input_data: Option<JsonValue>,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecutionLog {
    pub fn running(
        instance_id: Uuid,
        node_id: &str,
        node_type: &str,
        attempt_number: i32,
        input_data: Option<JsonValue>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_id,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            attempt_number,
            status: ExecutionStatus::Running,
            input_data,
            output_data: None,
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus, output: Option<JsonValue>, error: Option<String>) {
        self.status = status;
        self.output_data = output;
        self.error_message = error;
        if matches!(status, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped) {
            self.completed_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Waiting,
}

storage_enum!(ExecutionStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
    Waiting => "waiting",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTransitionLog {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub port: Option<String>,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<MemberId>,
    pub context_snapshot: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Automatic,
    Scheduled,
    Event,
}

impl Default for TriggerType {
    fn default() -> Self {
        TriggerType::Automatic
    }
}

storage_enum!(TriggerType {
    Manual => "manual",
    Automatic => "automatic",
    Scheduled => "scheduled",
    Event => "event",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceMigration {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub from_version_id: Uuid,
    pub to_version_id: Uuid,
    pub migration_type: MigrationType,
    pub node_mapping: JsonValue,
    pub migrated_by: Option<MemberId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Automatic,
    Manual,
    Admin,
}

storage_enum!(MigrationType {
    Automatic => "automatic",
    Manual => "manual",
    Admin => "admin",
});

// Visibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVisibilityRule {
    pub id: Uuid,
    pub version_id: Uuid,
    pub state_id: String,
    pub rule_type: VisibilityRuleType,
    /// `*` for entity-level rules, otherwise a field name.
    pub target: String,
    pub priority: i32,
    pub condition: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityRuleType {
    CanViewEntity,
    CanEditEntity,
    CanViewField,
    CanEditField,
}

storage_enum!(VisibilityRuleType {
    CanViewEntity => "can_view_entity",
    CanEditEntity => "can_edit_entity",
    CanViewField => "can_view_field",
    CanEditField => "can_edit_field",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_strings_round_trip_through_from_str() {
        assert_eq!("any_one".parse::<ApprovalType>().unwrap(), ApprovalType::AnyOne);
        assert_eq!(Decision::RequestChanges.to_string(), "request_changes");
        assert!("sideways".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn only_completed_and_cancelled_are_terminal() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::Waiting.is_terminal());
    }
}
