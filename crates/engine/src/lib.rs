pub mod actions;
pub mod approval;
pub mod conditions;
pub mod config;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod store;
pub mod template;
pub mod visibility;
pub mod workflow;

use thiserror::Error;
use uuid::Uuid;

/// Identifier of a member (user) in the surrounding membership system.
pub type MemberId = i64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Not found: {0}")]
    NotFound(String),

    // Definition errors
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("Workflow definition '{0}' has no published version")]
    NoPublishedVersion(String),
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("Invalid trigger payload for '{event}': {message}")]
    InvalidPayload { event: String, message: String },

    // Instance errors
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("Workflow instance {0} is already completed")]
    InstanceAlreadyCompleted(Uuid),
    #[error("Workflow instance {instance_id} is not waiting at node '{node_id}'")]
    NodeMismatch { instance_id: Uuid, node_id: String },
    #[error("A running instance already exists for this entity: {existing}")]
    DuplicateInstance { existing: Uuid },
    #[error("No matching transition from node '{node_id}' (instance {instance_id}, port {port})")]
    NoMatchingTransition {
        instance_id: Uuid,
        node_id: String,
        port: String,
    },
    #[error("Cycle detected in instance {instance_id}: exceeded {steps} steps at node '{node_id}'")]
    WorkflowCycleDetected {
        instance_id: Uuid,
        node_id: String,
        steps: usize,
    },
    #[error("Node '{node_id}' failed in instance {instance_id}: {message}")]
    StepFailed {
        instance_id: Uuid,
        node_id: String,
        message: String,
    },

    // Approval errors
    #[error("Approval not found: {0}")]
    ApprovalNotFound(Uuid),
    #[error("Approval {0} is no longer pending")]
    ApprovalNotPending(Uuid),
    #[error("Member {member_id} already responded to approval {approval_id}")]
    DuplicateResponse { approval_id: Uuid, member_id: MemberId },
    #[error("Member {member_id} is not eligible to respond to approval {approval_id}")]
    NotEligible { approval_id: Uuid, member_id: MemberId },
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Sqlx(_)
                | Error::Internal(_)
                | Error::Execution(_)
                | Error::StepFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_not_retryable() {
        let id = Uuid::new_v4();
        assert!(!Error::InstanceAlreadyCompleted(id).is_retryable());
        assert!(!Error::NodeMismatch {
            instance_id: id,
            node_id: "approval".into()
        }
        .is_retryable());
        assert!(Error::Execution("webhook returned HTTP 503".into()).is_retryable());
    }
}
