mod config;
mod factory;
mod models;
mod postgres;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use models::*;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Definition operations
    async fn save_definition(&self, definition: &WorkflowDefinition) -> crate::Result<()>;
    async fn get_definition(&self, id: Uuid) -> crate::Result<Option<WorkflowDefinition>>;
    async fn get_definition_by_slug(&self, slug: &str) -> crate::Result<Option<WorkflowDefinition>>;
    async fn list_active_definitions(&self) -> crate::Result<Vec<WorkflowDefinition>>;

    // Version operations
    async fn save_version(&self, version: &WorkflowVersion) -> crate::Result<()>;
    async fn get_version(&self, id: Uuid) -> crate::Result<Option<WorkflowVersion>>;
    /// Newest version first.
    async fn list_versions(&self, definition_id: Uuid) -> crate::Result<Vec<WorkflowVersion>>;

    // Instance operations
    async fn save_instance(&self, instance: &WorkflowInstance) -> crate::Result<()>;
    async fn get_instance(&self, id: Uuid) -> crate::Result<Option<WorkflowInstance>>;
    /// Running or waiting instance of a definition for one entity.
    async fn find_active_instance(
        &self,
        definition_id: Uuid,
        entity_type: &str,
        entity_id: &str,
    ) -> crate::Result<Option<WorkflowInstance>>;
    /// Instances in `status` ordered by id, starting after the `after` cursor.
    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
        after: Option<Uuid>,
        limit: i64,
    ) -> crate::Result<Vec<WorkflowInstance>>;
    async fn count_incomplete_instances(&self) -> crate::Result<i64>;

    // Approval operations
    async fn save_approval(&self, approval: &WorkflowApproval) -> crate::Result<()>;
    async fn get_approval(&self, id: Uuid) -> crate::Result<Option<WorkflowApproval>>;
    async fn find_pending_approval(&self, instance_id: Uuid, node_id: &str) -> crate::Result<Option<WorkflowApproval>>;
    async fn list_approvals_for_instance(&self, instance_id: Uuid) -> crate::Result<Vec<WorkflowApproval>>;
    async fn list_pending_approvals(&self) -> crate::Result<Vec<WorkflowApproval>>;
    /// Pending approvals whose deadline is before `now`.
    async fn list_overdue_approvals(&self, now: chrono::DateTime<chrono::Utc>) -> crate::Result<Vec<WorkflowApproval>>;

    // Approval responses. The response insert and the approval update commit together.
    async fn record_response(
        &self,
        response: &WorkflowApprovalResponse,
        approval: &WorkflowApproval,
    ) -> crate::Result<()>;
    async fn list_responses(&self, approval_id: Uuid) -> crate::Result<Vec<WorkflowApprovalResponse>>;

    // Execution log operations. Rows that reached completed/failed are never overwritten.
    async fn save_execution_log(&self, log: &WorkflowExecutionLog) -> crate::Result<()>;
    async fn count_execution_attempts(&self, instance_id: Uuid, node_id: &str) -> crate::Result<i64>;
    async fn find_waiting_log(&self, instance_id: Uuid, node_id: &str) -> crate::Result<Option<WorkflowExecutionLog>>;
    async fn list_execution_logs(&self, instance_id: Uuid) -> crate::Result<Vec<WorkflowExecutionLog>>;

    // Transition log operations
    async fn append_transition_log(&self, log: &WorkflowTransitionLog) -> crate::Result<()>;
    async fn list_transition_logs(&self, instance_id: Uuid) -> crate::Result<Vec<WorkflowTransitionLog>>;

    // Instance migration audit
    async fn save_instance_migration(&self, migration: &WorkflowInstanceMigration) -> crate::Result<()>;
    async fn list_instance_migrations(&self, instance_id: Uuid) -> crate::Result<Vec<WorkflowInstanceMigration>>;

    // Visibility rules
    async fn replace_visibility_rules(&self, version_id: Uuid, rules: &[WorkflowVisibilityRule]) -> crate::Result<()>;
    async fn list_visibility_rules(&self, version_id: Uuid, state_id: &str) -> crate::Result<Vec<WorkflowVisibilityRule>>;
}
