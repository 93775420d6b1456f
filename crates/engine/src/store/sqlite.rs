use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    store::{
        InstanceStatus, Store, WorkflowApproval, WorkflowApprovalResponse,
        WorkflowDefinition, WorkflowExecutionLog, WorkflowInstance, WorkflowInstanceMigration,
        WorkflowTransitionLog, WorkflowVersion, WorkflowVisibilityRule,
    },
    Error, Result,
};

const DEFINITION_COLUMNS: &str = "id, name, slug, description, entity_type, plugin_name, version, \
     current_version_id, is_active, is_default, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, definition_id, version_number, definition, canvas_layout, status, \
     change_notes, published_at, published_by, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "id, definition_id, version_id, entity_type, entity_id, status, \
     current_state_id, previous_state_id, active_nodes, context, triggered_by, parent_instance_id, \
     parent_node_id, error_message, started_at, completed_at, created_at, updated_at";

const APPROVAL_COLUMNS: &str = "id, instance_id, node_id, execution_log_id, approval_type, approver_type, \
     approver_config, approver_pool, required_count, approved_count, rejected_count, abstained_count, \
     status, gate_config, escalation_config, deadline, created_at, updated_at, resolved_at";

const EXECUTION_LOG_COLUMNS: &str = "id, instance_id, node_id, node_type, attempt_number, status, \
     input_data, output_data, error_message, started_at, completed_at, created_at";

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(path: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", path);

        let in_memory = path == ":memory:";
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };

        // Every connection to ":memory:" is a separate database, so keep exactly one.
        let max_connections = if in_memory { 1 } else { max_connections };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to SQLite: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }
}

fn uuid_col(r: &SqliteRow, col: &str) -> Result<Uuid> {
    Ok(r.get::<String, _>(col).parse()?)
}

fn opt_uuid_col(r: &SqliteRow, col: &str) -> Result<Option<Uuid>> {
    Ok(r.get::<Option<String>, _>(col).map(|s| s.parse()).transpose()?)
}

fn json_col(r: &SqliteRow, col: &str) -> Result<JsonValue> {
    Ok(serde_json::from_str(r.get::<&str, _>(col))?)
}

fn opt_json_col(r: &SqliteRow, col: &str) -> Result<Option<JsonValue>> {
    Ok(r.get::<Option<String>, _>(col)
        .map(|s| serde_json::from_str(&s))
        .transpose()?)
}

fn opt_json(value: &Option<JsonValue>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn definition_from_row(r: &SqliteRow) -> Result<WorkflowDefinition> {
    Ok(WorkflowDefinition {
        id: uuid_col(r, "id")?,
        name: r.get("name"),
        slug: r.get("slug"),
        description: r.get("description"),
        entity_type: r.get("entity_type"),
        plugin_name: r.get("plugin_name"),
        version: r.get("version"),
        current_version_id: opt_uuid_col(r, "current_version_id")?,
        is_active: r.get("is_active"),
        is_default: r.get("is_default"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn version_from_row(r: &SqliteRow) -> Result<WorkflowVersion> {
    Ok(WorkflowVersion {
        id: uuid_col(r, "id")?,
        definition_id: uuid_col(r, "definition_id")?,
        version_number: r.get("version_number"),
        definition: json_col(r, "definition")?,
        canvas_layout: opt_json_col(r, "canvas_layout")?,
        status: r.get::<&str, _>("status").parse()?,
        change_notes: r.get("change_notes"),
        published_at: r.get("published_at"),
        published_by: r.get("published_by"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn instance_from_row(r: &SqliteRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: uuid_col(r, "id")?,
        definition_id: uuid_col(r, "definition_id")?,
        version_id: uuid_col(r, "version_id")?,
        entity_type: r.get("entity_type"),
        entity_id: r.get("entity_id"),
        status: r.get::<&str, _>("status").parse()?,
        current_state_id: r.get("current_state_id"),
        previous_state_id: r.get("previous_state_id"),
        active_nodes: serde_json::from_str(r.get::<&str, _>("active_nodes"))?,
        context: json_col(r, "context")?,
        triggered_by: r.get("triggered_by"),
        parent_instance_id: opt_uuid_col(r, "parent_instance_id")?,
        parent_node_id: r.get("parent_node_id"),
        error_message: r.get("error_message"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn approval_from_row(r: &SqliteRow) -> Result<WorkflowApproval> {
    Ok(WorkflowApproval {
        id: uuid_col(r, "id")?,
        instance_id: uuid_col(r, "instance_id")?,
        node_id: r.get("node_id"),
        execution_log_id: opt_uuid_col(r, "execution_log_id")?,
        approval_type: r.get::<&str, _>("approval_type").parse()?,
        approver_type: r.get::<&str, _>("approver_type").parse()?,
        approver_config: json_col(r, "approver_config")?,
        approver_pool: serde_json::from_str(r.get::<&str, _>("approver_pool"))?,
        required_count: r.get("required_count"),
        approved_count: r.get("approved_count"),
        rejected_count: r.get("rejected_count"),
        abstained_count: r.get("abstained_count"),
        status: r.get::<&str, _>("status").parse()?,
        gate_config: json_col(r, "gate_config")?,
        escalation_config: opt_json_col(r, "escalation_config")?,
        deadline: r.get("deadline"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        resolved_at: r.get("resolved_at"),
    })
}

fn response_from_row(r: &SqliteRow) -> Result<WorkflowApprovalResponse> {
    Ok(WorkflowApprovalResponse {
        id: uuid_col(r, "id")?,
        approval_id: uuid_col(r, "approval_id")?,
        member_id: r.get("member_id"),
        decision: r.get::<&str, _>("decision").parse()?,
        comment: r.get("comment"),
        responded_at: r.get("responded_at"),
    })
}

fn execution_log_from_row(r: &SqliteRow) -> Result<WorkflowExecutionLog> {
    Ok(WorkflowExecutionLog {
        id: uuid_col(r, "id")?,
        instance_id: uuid_col(r, "instance_id")?,
        node_id: r.get("node_id"),
        node_type: r.get("node_type"),
        attempt_number: r.get("attempt_number"),
        status: r.get::<&str, _>("status").parse()?,
        input_data: opt_json_col(r, "input_data")?,
        output_data: opt_json_col(r, "output_data")?,
        error_message: r.get("error_message"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        created_at: r.get("created_at"),
    })
}

fn transition_log_from_row(r: &SqliteRow) -> Result<WorkflowTransitionLog> {
    Ok(WorkflowTransitionLog {
        id: uuid_col(r, "id")?,
        instance_id: uuid_col(r, "instance_id")?,
        from_state: r.get("from_state"),
        to_state: r.get("to_state"),
        port: r.get("port"),
        trigger_type: r.get::<&str, _>("trigger_type").parse()?,
        triggered_by: r.get("triggered_by"),
        context_snapshot: json_col(r, "context_snapshot")?,
        created_at: r.get("created_at"),
    })
}

fn migration_from_row(r: &SqliteRow) -> Result<WorkflowInstanceMigration> {
    Ok(WorkflowInstanceMigration {
        id: uuid_col(r, "id")?,
        instance_id: uuid_col(r, "instance_id")?,
        from_version_id: uuid_col(r, "from_version_id")?,
        to_version_id: uuid_col(r, "to_version_id")?,
        migration_type: r.get::<&str, _>("migration_type").parse()?,
        node_mapping: json_col(r, "node_mapping")?,
        migrated_by: r.get("migrated_by"),
        created_at: r.get("created_at"),
    })
}

fn visibility_rule_from_row(r: &SqliteRow) -> Result<WorkflowVisibilityRule> {
    Ok(WorkflowVisibilityRule {
        id: uuid_col(r, "id")?,
        version_id: uuid_col(r, "version_id")?,
        state_id: r.get("state_id"),
        rule_type: r.get::<&str, _>("rule_type").parse()?,
        target: r.get("target"),
        priority: r.get("priority"),
        condition: opt_json_col(r, "rule_condition")?,
        created_at: r.get("created_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    // Definition operations
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        debug!("Saving workflow definition: {} ({})", definition.slug, definition.id);

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (
                id, name, slug, description, entity_type, plugin_name, version,
                current_version_id, is_active, is_default, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                entity_type = excluded.entity_type,
                plugin_name = excluded.plugin_name,
                version = excluded.version,
                current_version_id = excluded.current_version_id,
                is_active = excluded.is_active,
                is_default = excluded.is_default,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(definition.id.to_string())
        .bind(&definition.name)
        .bind(&definition.slug)
        .bind(&definition.description)
        .bind(&definition.entity_type)
        .bind(&definition.plugin_name)
        .bind(definition.version)
        .bind(definition.current_version_id.map(|id| id.to_string()))
        .bind(definition.is_active)
        .bind(definition.is_default)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        debug!("Getting workflow definition: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_definitions WHERE id = ?1",
            DEFINITION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn get_definition_by_slug(&self, slug: &str) -> Result<Option<WorkflowDefinition>> {
        debug!("Getting workflow definition by slug: {}", slug);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_definitions WHERE slug = ?1",
            DEFINITION_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list_active_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_definitions WHERE is_active = 1 ORDER BY slug",
            DEFINITION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(definition_from_row).collect()
    }

    // Version operations
    async fn save_version(&self, version: &WorkflowVersion) -> Result<()> {
        debug!(
            "Saving workflow version: {} (v{})",
            version.id, version.version_number
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_versions (
                id, definition_id, version_number, definition, canvas_layout, status,
                change_notes, published_at, published_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                definition = excluded.definition,
                canvas_layout = excluded.canvas_layout,
                status = excluded.status,
                change_notes = excluded.change_notes,
                published_at = excluded.published_at,
                published_by = excluded.published_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(version.id.to_string())
        .bind(version.definition_id.to_string())
        .bind(version.version_number)
        .bind(serde_json::to_string(&version.definition)?)
        .bind(opt_json(&version.canvas_layout)?)
        .bind(version.status.to_string())
        .bind(&version.change_notes)
        .bind(version.published_at)
        .bind(version.published_by)
        .bind(version.created_at)
        .bind(version.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>> {
        debug!("Getting workflow version: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_versions WHERE id = ?1",
            VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, definition_id: Uuid) -> Result<Vec<WorkflowVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_versions WHERE definition_id = ?1 ORDER BY version_number DESC",
            VERSION_COLUMNS
        ))
        .bind(definition_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    // Instance operations
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        debug!("Saving workflow instance: {} ({})", instance.id, instance.status);

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, definition_id, version_id, entity_type, entity_id, status,
                current_state_id, previous_state_id, active_nodes, context, triggered_by,
                parent_instance_id, parent_node_id, error_message,
                started_at, completed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                version_id = excluded.version_id,
                status = excluded.status,
                current_state_id = excluded.current_state_id,
                previous_state_id = excluded.previous_state_id,
                active_nodes = excluded.active_nodes,
                context = excluded.context,
                error_message = excluded.error_message,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(instance.version_id.to_string())
        .bind(&instance.entity_type)
        .bind(&instance.entity_id)
        .bind(instance.status.to_string())
        .bind(&instance.current_state_id)
        .bind(&instance.previous_state_id)
        .bind(serde_json::to_string(&instance.active_nodes)?)
        .bind(serde_json::to_string(&instance.context)?)
        .bind(instance.triggered_by)
        .bind(instance.parent_instance_id.map(|id| id.to_string()))
        .bind(&instance.parent_node_id)
        .bind(&instance.error_message)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        debug!("Getting workflow instance: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE id = ?1",
            INSTANCE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn find_active_instance(
        &self,
        definition_id: Uuid,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances \
             WHERE definition_id = ?1 AND entity_type = ?2 AND entity_id = ?3 \
             AND status IN ('pending', 'running', 'waiting') \
             ORDER BY created_at DESC LIMIT 1",
            INSTANCE_COLUMNS
        ))
        .bind(definition_id.to_string())
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE status = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            INSTANCE_COLUMNS
        ))
        .bind(status.to_string())
        .bind(after.map(|id| id.to_string()).unwrap_or_default())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn count_incomplete_instances(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM workflow_instances WHERE completed_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total"))
    }

    // Approval operations
    async fn save_approval(&self, approval: &WorkflowApproval) -> Result<()> {
        debug!("Saving approval: {} ({})", approval.id, approval.status);

        sqlx::query(
            r#"
            INSERT INTO workflow_approvals (
                id, instance_id, node_id, execution_log_id, approval_type, approver_type,
                approver_config, approver_pool, required_count, approved_count, rejected_count,
                abstained_count, status, gate_config, escalation_config, deadline,
                created_at, updated_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(id) DO UPDATE SET
                approver_config = excluded.approver_config,
                approver_pool = excluded.approver_pool,
                required_count = excluded.required_count,
                approved_count = excluded.approved_count,
                rejected_count = excluded.rejected_count,
                abstained_count = excluded.abstained_count,
                status = excluded.status,
                escalation_config = excluded.escalation_config,
                deadline = excluded.deadline,
                updated_at = excluded.updated_at,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(approval.id.to_string())
        .bind(approval.instance_id.to_string())
        .bind(&approval.node_id)
        .bind(approval.execution_log_id.map(|id| id.to_string()))
        .bind(approval.approval_type.to_string())
        .bind(approval.approver_type.to_string())
        .bind(serde_json::to_string(&approval.approver_config)?)
        .bind(serde_json::to_string(&approval.approver_pool)?)
        .bind(approval.required_count)
        .bind(approval.approved_count)
        .bind(approval.rejected_count)
        .bind(approval.abstained_count)
        .bind(approval.status.to_string())
        .bind(serde_json::to_string(&approval.gate_config)?)
        .bind(opt_json(&approval.escalation_config)?)
        .bind(approval.deadline)
        .bind(approval.created_at)
        .bind(approval.updated_at)
        .bind(approval.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<WorkflowApproval>> {
        debug!("Getting approval: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_approvals WHERE id = ?1",
            APPROVAL_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(approval_from_row).transpose()
    }

    async fn find_pending_approval(&self, instance_id: Uuid, node_id: &str) -> Result<Option<WorkflowApproval>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_approvals \
             WHERE instance_id = ?1 AND node_id = ?2 AND status = 'pending' \
             ORDER BY created_at DESC LIMIT 1",
            APPROVAL_COLUMNS
        ))
        .bind(instance_id.to_string())
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(approval_from_row).transpose()
    }

    async fn list_approvals_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkflowApproval>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_approvals WHERE instance_id = ?1 ORDER BY created_at",
            APPROVAL_COLUMNS
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }

    async fn list_pending_approvals(&self) -> Result<Vec<WorkflowApproval>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_approvals WHERE status = 'pending' ORDER BY created_at",
            APPROVAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }

    async fn list_overdue_approvals(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowApproval>> {
        // Timestamps are stored as text with varying precision, compare them after decoding.
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_approvals \
             WHERE status = 'pending' AND deadline IS NOT NULL ORDER BY created_at",
            APPROVAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let approvals = rows
            .iter()
            .map(approval_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(approvals
            .into_iter()
            .filter(|a| a.deadline.map(|d| d < now).unwrap_or(false))
            .collect())
    }

    async fn record_response(
        &self,
        response: &WorkflowApprovalResponse,
        approval: &WorkflowApproval,
    ) -> Result<()> {
        debug!(
            "Recording {} from member {} on approval {}",
            response.decision, response.member_id, response.approval_id
        );

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_approval_responses (
                id, approval_id, member_id, decision, comment, responded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(response.id.to_string())
        .bind(response.approval_id.to_string())
        .bind(response.member_id)
        .bind(response.decision.to_string())
        .bind(&response.comment)
        .bind(response.responded_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db)) = &inserted {
            if db.is_unique_violation() {
                return Err(Error::DuplicateResponse {
                    approval_id: response.approval_id,
                    member_id: response.member_id,
                });
            }
        }
        inserted?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_approvals SET
                approver_config = ?1,
                approved_count = ?2,
                rejected_count = ?3,
                abstained_count = ?4,
                status = ?5,
                updated_at = ?6,
                resolved_at = ?7
            WHERE id = ?8 AND status = 'pending'
            "#,
        )
        .bind(serde_json::to_string(&approval.approver_config)?)
        .bind(approval.approved_count)
        .bind(approval.rejected_count)
        .bind(approval.abstained_count)
        .bind(approval.status.to_string())
        .bind(approval.updated_at)
        .bind(approval.resolved_at)
        .bind(approval.id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::ApprovalNotPending(approval.id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_responses(&self, approval_id: Uuid) -> Result<Vec<WorkflowApprovalResponse>> {
        let rows = sqlx::query(
            r#"
            SELECT id, approval_id, member_id, decision, comment, responded_at
            FROM workflow_approval_responses
            WHERE approval_id = ?1
            ORDER BY responded_at
            "#,
        )
        .bind(approval_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(response_from_row).collect()
    }

    // Execution log operations
    async fn save_execution_log(&self, log: &WorkflowExecutionLog) -> Result<()> {
        debug!(
            "Saving execution log: {} node={} status={}",
            log.id, log.node_id, log.status
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_execution_logs (
                id, instance_id, node_id, node_type, attempt_number, status,
                input_data, output_data, error_message, started_at, completed_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                output_data = excluded.output_data,
                error_message = excluded.error_message,
                completed_at = excluded.completed_at
            WHERE workflow_execution_logs.status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.instance_id.to_string())
        .bind(&log.node_id)
        .bind(&log.node_type)
        .bind(log.attempt_number)
        .bind(log.status.to_string())
        .bind(opt_json(&log.input_data)?)
        .bind(opt_json(&log.output_data)?)
        .bind(&log.error_message)
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_execution_attempts(&self, instance_id: Uuid, node_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM workflow_execution_logs WHERE instance_id = ?1 AND node_id = ?2",
        )
        .bind(instance_id.to_string())
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total"))
    }

    async fn find_waiting_log(&self, instance_id: Uuid, node_id: &str) -> Result<Option<WorkflowExecutionLog>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_execution_logs \
             WHERE instance_id = ?1 AND node_id = ?2 AND status = 'waiting' \
             ORDER BY created_at DESC LIMIT 1",
            EXECUTION_LOG_COLUMNS
        ))
        .bind(instance_id.to_string())
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(execution_log_from_row).transpose()
    }

    async fn list_execution_logs(&self, instance_id: Uuid) -> Result<Vec<WorkflowExecutionLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_execution_logs WHERE instance_id = ?1 ORDER BY created_at, rowid",
            EXECUTION_LOG_COLUMNS
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_log_from_row).collect()
    }

    // Transition log operations
    async fn append_transition_log(&self, log: &WorkflowTransitionLog) -> Result<()> {
        debug!(
            "Transition {:?} -> {} on instance {}",
            log.from_state, log.to_state, log.instance_id
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_transition_logs (
                id, instance_id, from_state, to_state, port, trigger_type,
                triggered_by, context_snapshot, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.instance_id.to_string())
        .bind(&log.from_state)
        .bind(&log.to_state)
        .bind(&log.port)
        .bind(log.trigger_type.to_string())
        .bind(log.triggered_by)
        .bind(serde_json::to_string(&log.context_snapshot)?)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transition_logs(&self, instance_id: Uuid) -> Result<Vec<WorkflowTransitionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, from_state, to_state, port, trigger_type,
                   triggered_by, context_snapshot, created_at
            FROM workflow_transition_logs
            WHERE instance_id = ?1
            ORDER BY created_at, rowid
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transition_log_from_row).collect()
    }

    // Instance migration audit
    async fn save_instance_migration(&self, migration: &WorkflowInstanceMigration) -> Result<()> {
        debug!(
            "Saving instance migration: {} {} -> {}",
            migration.instance_id, migration.from_version_id, migration.to_version_id
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_instance_migrations (
                id, instance_id, from_version_id, to_version_id, migration_type,
                node_mapping, migrated_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(migration.id.to_string())
        .bind(migration.instance_id.to_string())
        .bind(migration.from_version_id.to_string())
        .bind(migration.to_version_id.to_string())
        .bind(migration.migration_type.to_string())
        .bind(serde_json::to_string(&migration.node_mapping)?)
        .bind(migration.migrated_by)
        .bind(migration.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_instance_migrations(&self, instance_id: Uuid) -> Result<Vec<WorkflowInstanceMigration>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, from_version_id, to_version_id, migration_type,
                   node_mapping, migrated_by, created_at
            FROM workflow_instance_migrations
            WHERE instance_id = ?1
            ORDER BY created_at
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(migration_from_row).collect()
    }

    // Visibility rules
    async fn replace_visibility_rules(&self, version_id: Uuid, rules: &[WorkflowVisibilityRule]) -> Result<()> {
        debug!("Replacing {} visibility rules for version {}", rules.len(), version_id);

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM workflow_visibility_rules WHERE version_id = ?1")
            .bind(version_id.to_string())
            .execute(&mut *tx)
            .await?;

        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO workflow_visibility_rules (
                    id, version_id, state_id, rule_type, target, priority, rule_condition, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(rule.id.to_string())
            .bind(version_id.to_string())
            .bind(&rule.state_id)
            .bind(rule.rule_type.to_string())
            .bind(&rule.target)
            .bind(rule.priority)
            .bind(opt_json(&rule.condition)?)
            .bind(rule.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_visibility_rules(&self, version_id: Uuid, state_id: &str) -> Result<Vec<WorkflowVisibilityRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, version_id, state_id, rule_type, target, priority, rule_condition, created_at
            FROM workflow_visibility_rules
            WHERE version_id = ?1 AND state_id = ?2
            ORDER BY priority DESC, rowid
            "#,
        )
        .bind(version_id.to_string())
        .bind(state_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(visibility_rule_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ApprovalStatus, Decision, ExecutionStatus, VersionStatus};
    use serde_json::json;

    async fn store() -> SqliteStore {
        let store = SqliteStore::new(":memory:", 1).await.unwrap();
        store.init().await.unwrap();
        store
    }

    async fn seeded_instance(store: &SqliteStore) -> WorkflowInstance {
        let definition = WorkflowDefinition::new("Hire", "hire", "officer");
        store.save_definition(&definition).await.unwrap();
        let now = Utc::now();
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_number: 1,
            definition: json!({"nodes": {}, "edges": []}),
            canvas_layout: None,
            status: VersionStatus::Draft,
            change_notes: None,
            published_at: None,
            published_by: None,
            created_at: now,
            updated_at: now,
        };
        store.save_version(&version).await.unwrap();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_id: version.id,
            entity_type: "officer".into(),
            entity_id: Some("42".into()),
            status: InstanceStatus::Waiting,
            current_state_id: Some("review".into()),
            previous_state_id: None,
            active_nodes: vec!["review".into()],
            context: json!({"entity": {"id": 42}}),
            triggered_by: Some(7),
            parent_instance_id: None,
            parent_node_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        store.save_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn instance_round_trips_and_is_found_as_active() {
        let store = store().await;
        let instance = seeded_instance(&store).await;

        let loaded = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.active_nodes, vec!["review".to_string()]);
        assert_eq!(loaded.context["entity"]["id"], 42);

        let active = store
            .find_active_instance(instance.definition_id, "officer", "42")
            .await
            .unwrap();
        assert_eq!(active.map(|i| i.id), Some(instance.id));
        assert_eq!(store.count_incomplete_instances().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_instances_still_count_as_incomplete() {
        let store = store().await;
        let mut instance = seeded_instance(&store).await;

        instance.status = InstanceStatus::Failed;
        instance.error_message = Some("webhook unreachable".into());
        store.save_instance(&instance).await.unwrap();
        assert_eq!(store.count_incomplete_instances().await.unwrap(), 1);

        instance.status = InstanceStatus::Completed;
        instance.completed_at = Some(Utc::now());
        store.save_instance(&instance).await.unwrap();
        assert_eq!(store.count_incomplete_instances().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finished_execution_logs_are_not_overwritten() {
        let store = store().await;
        let instance = seeded_instance(&store).await;

        let mut log = WorkflowExecutionLog::running(instance.id, "notify", "action", 1, None);
        log.finish(ExecutionStatus::Completed, Some(json!({"sent": true})), None);
        store.save_execution_log(&log).await.unwrap();

        log.finish(ExecutionStatus::Failed, None, Some("late failure".into()));
        store.save_execution_log(&log).await.unwrap();

        let logs = store.list_execution_logs(instance.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn second_response_from_same_member_is_rejected() {
        let store = store().await;
        let instance = seeded_instance(&store).await;
        let now = Utc::now();
        let mut approval = WorkflowApproval {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            node_id: "review".into(),
            execution_log_id: None,
            approval_type: Default::default(),
            approver_type: crate::store::ApproverType::Static,
            approver_config: json!({}),
            approver_pool: vec![1, 2, 3],
            required_count: 2,
            approved_count: 0,
            rejected_count: 0,
            abstained_count: 0,
            status: ApprovalStatus::Pending,
            gate_config: json!({}),
            escalation_config: None,
            deadline: Some(now - chrono::Duration::hours(1)),
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        store.save_approval(&approval).await.unwrap();
        assert_eq!(store.list_overdue_approvals(now).await.unwrap().len(), 1);

        let response = WorkflowApprovalResponse {
            id: Uuid::new_v4(),
            approval_id: approval.id,
            member_id: 1,
            decision: Decision::Approve,
            comment: None,
            responded_at: now,
        };
        approval.approved_count = 1;
        store.record_response(&response, &approval).await.unwrap();

        let again = WorkflowApprovalResponse {
            id: Uuid::new_v4(),
            ..response.clone()
        };
        let err = store.record_response(&again, &approval).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateResponse { member_id: 1, .. }));

        let stored = store.get_approval(approval.id).await.unwrap().unwrap();
        assert_eq!(stored.approved_count, 1);
        assert_eq!(store.list_responses(approval.id).await.unwrap().len(), 1);
    }
}
