use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::graph::{Graph, GraphDefinition};
use super::lock::KeyedLocks;
use crate::approval::ApprovalManager;
use crate::registry::Registry;
use crate::store::{
    ApprovalStatus, MigrationType, Store, VersionStatus, WorkflowDefinition, WorkflowInstanceMigration, WorkflowVersion,
    WorkflowVisibilityRule,
};
use crate::{Error, MemberId, Result};

/// Node-level differences between two versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VersionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

/// Draft, publish and archive versions of a definition, and move instances between them.
pub struct VersionManager {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    approvals: Arc<ApprovalManager>,
    instance_locks: Arc<KeyedLocks<Uuid>>,
}

impl VersionManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        approvals: Arc<ApprovalManager>,
        instance_locks: Arc<KeyedLocks<Uuid>>,
    ) -> Self {
        Self {
            store,
            registry,
            approvals,
            instance_locks,
        }
    }

    pub async fn create_draft(
        &self,
        definition_id: Uuid,
        graph: Value,
        change_notes: Option<String>,
    ) -> Result<WorkflowVersion> {
        let mut definition = self.definition(definition_id).await?;
        GraphDefinition::from_value(&graph)?;

        let now = Utc::now();
        definition.version += 1;
        definition.updated_at = now;
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id,
            version_number: definition.version,
            definition: graph,
            canvas_layout: None,
            status: VersionStatus::Draft,
            change_notes,
            published_at: None,
            published_by: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_version(&version).await?;
        self.store.save_definition(&definition).await?;
        info!(
            "Created draft version {} of {}",
            version.version_number, definition.slug
        );
        Ok(version)
    }

    /// Replaces the graph of a draft. Published and archived versions are immutable.
    pub async fn update_draft(
        &self,
        version_id: Uuid,
        graph: Value,
        change_notes: Option<String>,
    ) -> Result<WorkflowVersion> {
        let mut version = self.version(version_id).await?;
        if version.status != VersionStatus::Draft {
            return Err(Error::Validation(format!(
                "version {} is {} and cannot be edited",
                version_id, version.status
            )));
        }
        GraphDefinition::from_value(&graph)?;
        version.definition = graph;
        if change_notes.is_some() {
            version.change_notes = change_notes;
        }
        version.updated_at = Utc::now();
        self.store.save_version(&version).await?;
        Ok(version)
    }

    /// Validates and publishes a draft, archiving the previously published version.
    pub async fn publish(&self, version_id: Uuid, published_by: Option<MemberId>) -> Result<WorkflowVersion> {
        let mut version = self.version(version_id).await?;
        if version.status != VersionStatus::Draft {
            return Err(Error::Validation(format!(
                "only drafts can be published, version {} is {}",
                version_id, version.status
            )));
        }
        let mut definition = self.definition(version.definition_id).await?;
        let graph = Graph::from_value(
            &version.definition,
            &self.registry,
            self.registry.entity(&definition.entity_type),
        )?;

        let now = Utc::now();
        for mut previous in self.store.list_versions(definition.id).await? {
            if previous.id != version.id && previous.status == VersionStatus::Published {
                previous.status = VersionStatus::Archived;
                previous.updated_at = now;
                self.store.save_version(&previous).await?;
            }
        }

        version.status = VersionStatus::Published;
        version.published_at = Some(now);
        version.published_by = published_by;
        version.updated_at = now;
        self.store.save_version(&version).await?;

        let rules: Vec<WorkflowVisibilityRule> = graph
            .nodes()
            .flat_map(|node| {
                node.visibility.iter().map(move |rule| WorkflowVisibilityRule {
                    id: Uuid::new_v4(),
                    version_id: version.id,
                    state_id: node.id.clone(),
                    rule_type: rule.rule_type,
                    target: rule.target.clone(),
                    priority: rule.priority,
                    condition: rule.condition.clone(),
                    created_at: now,
                })
            })
            .collect();
        self.store.replace_visibility_rules(version.id, &rules).await?;

        definition.current_version_id = Some(version.id);
        definition.is_active = true;
        definition.updated_at = now;
        self.store.save_definition(&definition).await?;

        info!(
            "Published version {} of {} ({} visibility rules)",
            version.version_number,
            definition.slug,
            rules.len()
        );
        Ok(version)
    }

    /// Archives a version; archiving the current version deactivates the definition.
    pub async fn archive(&self, version_id: Uuid) -> Result<WorkflowVersion> {
        let mut version = self.version(version_id).await?;
        let now = Utc::now();
        version.status = VersionStatus::Archived;
        version.updated_at = now;
        self.store.save_version(&version).await?;

        let mut definition = self.definition(version.definition_id).await?;
        if definition.current_version_id == Some(version_id) {
            definition.is_active = false;
            definition.updated_at = now;
            self.store.save_definition(&definition).await?;
            info!("Archived current version of {}; definition deactivated", definition.slug);
        }
        Ok(version)
    }

    pub async fn current_version(&self, definition_id: Uuid) -> Result<Option<WorkflowVersion>> {
        let definition = self.definition(definition_id).await?;
        match definition.current_version_id {
            Some(id) => self.store.get_version(id).await,
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn version_history(&self, definition_id: Uuid) -> Result<Vec<WorkflowVersion>> {
        self.store.list_versions(definition_id).await
    }

    pub async fn compare_versions(&self, from_id: Uuid, to_id: Uuid) -> Result<VersionDiff> {
        let from = node_values(&self.version(from_id).await?)?;
        let to = node_values(&self.version(to_id).await?)?;

        let mut diff = VersionDiff::default();
        for (id, node) in &to {
            match from.get(id) {
                None => diff.added.push(id.clone()),
                Some(previous) if previous != node => diff.modified.push(id.clone()),
                Some(_) => {}
            }
        }
        diff.removed = from.keys().filter(|id| !to.contains_key(*id)).cloned().collect();
        Ok(diff)
    }

    /// Moves a running or waiting instance onto another version of its definition.
    ///
    /// Active nodes map by identical id unless `node_mapping` says otherwise, and every
    /// one of them must land on a node of the target graph. The target must be published
    /// unless `force` is set, which also allows rolling back to an archived version.
    pub async fn migrate_instance(
        &self,
        instance_id: Uuid,
        target_version_id: Uuid,
        migrated_by: Option<MemberId>,
        node_mapping: Option<HashMap<String, String>>,
        force: bool,
    ) -> Result<WorkflowInstanceMigration> {
        let _guard = self.instance_locks.lock(&instance_id).await;
        let mut instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Err(Error::InstanceAlreadyCompleted(instance_id));
        }

        let target = self.version(target_version_id).await?;
        if target.definition_id != instance.definition_id {
            return Err(Error::Validation(format!(
                "version {} belongs to another definition",
                target_version_id
            )));
        }
        match (target.status, force) {
            (VersionStatus::Published, _) | (VersionStatus::Archived, true) => {}
            (status, _) => {
                return Err(Error::Validation(format!(
                    "cannot migrate to a {} version without force",
                    status
                )));
            }
        }
        let definition = self.definition(instance.definition_id).await?;
        let graph = Graph::from_value(
            &target.definition,
            &self.registry,
            self.registry.entity(&definition.entity_type),
        )?;

        let explicit = node_mapping.is_some();
        let requested = node_mapping.unwrap_or_default();
        let map = |node: &str| -> Result<String> {
            let mapped = requested.get(node).cloned().unwrap_or_else(|| node.to_string());
            if graph.node(&mapped).is_none() {
                return Err(Error::Validation(format!(
                    "node '{}' has no counterpart in version {}",
                    node, target.version_number
                )));
            }
            Ok(mapped)
        };

        let mut applied = BTreeMap::new();
        let mut active = Vec::with_capacity(instance.active_nodes.len());
        for node in &instance.active_nodes {
            let mapped = map(node)?;
            applied.insert(node.clone(), mapped.clone());
            active.push(mapped);
        }
        let current = match &instance.current_state_id {
            Some(node) if applied.contains_key(node) => applied.get(node).cloned(),
            Some(node) => map(node).ok(),
            None => None,
        };

        for approval in self.store.list_approvals_for_instance(instance_id).await? {
            if approval.status != ApprovalStatus::Pending {
                continue;
            }
            if let Some(mapped) = applied.get(&approval.node_id) {
                if *mapped != approval.node_id {
                    self.approvals.repoint(approval.id, mapped).await?;
                }
            }
        }

        let now = Utc::now();

        let migration = WorkflowInstanceMigration {
            id: Uuid::new_v4(),
            instance_id,
            from_version_id: instance.version_id,
            to_version_id: target.id,
            migration_type: if force {
                MigrationType::Admin
            } else if explicit {
                MigrationType::Manual
            } else {
                MigrationType::Automatic
            },
            node_mapping: json!(applied),
            migrated_by,
            created_at: now,
        };

        instance.version_id = target.id;
        instance.active_nodes = active;
        instance.current_state_id = current;
        instance.updated_at = now;
        self.store.save_instance(&instance).await?;
        self.store.save_instance_migration(&migration).await?;

        info!(
            "Migrated instance {} to version {} ({})",
            instance_id, target.version_number, migration.migration_type
        );
        Ok(migration)
    }

    async fn definition(&self, id: Uuid) -> Result<WorkflowDefinition> {
        self.store
            .get_definition(id)
            .await?
            .ok_or_else(|| Error::DefinitionNotFound(id.to_string()))
    }

    async fn version(&self, id: Uuid) -> Result<WorkflowVersion> {
        self.store
            .get_version(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow version {}", id)))
    }
}

fn node_values(version: &WorkflowVersion) -> Result<BTreeMap<String, Value>> {
    let graph = GraphDefinition::from_value(&version.definition)?;
    graph
        .nodes
        .into_iter()
        .map(|(id, node)| Ok((id, serde_json::to_value(node)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalGateConfig, LogNotifier, StaticDirectory};
    use crate::registry::CorePlugin;
    use crate::store::{create_store, DatabaseConfig, Decision, InstanceStatus, WorkflowInstance};

    async fn manager() -> VersionManager {
        let store = create_store(&DatabaseConfig::in_memory()).await.unwrap();
        let registry = Arc::new(Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier))]).unwrap());
        let approvals = Arc::new(ApprovalManager::new(
            store.clone(),
            registry.clone(),
            Arc::new(StaticDirectory::default()),
            Arc::new(LogNotifier),
        ));
        VersionManager::new(store, registry, approvals, Arc::new(KeyedLocks::new()))
    }

    fn graph(middle: &str) -> Value {
        json!({
            "nodes": {
                "start": {"type": "trigger", "outputs": [{"target": middle}]},
                middle: {"type": "state", "visibility": [
                    {"rule_type": "can_edit_entity", "priority": 5, "condition": {"role": "Secretary"}}
                ]},
                "end": {"type": "end"}
            },
            "edges": [{"source": middle, "target": "end", "trigger_type": "manual"}]
        })
    }

    async fn definition(manager: &VersionManager) -> WorkflowDefinition {
        let definition = WorkflowDefinition::new("Leave", &format!("leave-{}", Uuid::new_v4()), "leave");
        manager.store.save_definition(&definition).await.unwrap();
        definition
    }

    #[tokio::test]
    async fn publishing_archives_the_previous_version() {
        let manager = manager().await;
        let definition = definition(&manager).await;

        let v1 = manager.create_draft(definition.id, graph("review"), None).await.unwrap();
        assert_eq!(v1.version_number, 1);
        manager.publish(v1.id, Some(4)).await.unwrap();
        let rules = manager.store.list_visibility_rules(v1.id, "review").await.unwrap();
        assert_eq!(rules.len(), 1);

        let v2 = manager.create_draft(definition.id, graph("check"), Some("rename".into())).await.unwrap();
        let v2 = manager.update_draft(v2.id, graph("vet"), None).await.unwrap();
        assert_eq!(v2.change_notes.as_deref(), Some("rename"));
        manager.publish(v2.id, None).await.unwrap();

        let history = manager.version_history(definition.id).await.unwrap();
        assert_eq!(history[0].id, v2.id);
        assert_eq!(history[1].status, VersionStatus::Archived);
        assert_eq!(manager.current_version(definition.id).await.unwrap().unwrap().id, v2.id);
        assert!(manager.update_draft(v2.id, graph("x"), None).await.is_err());

        let diff = manager.compare_versions(v1.id, v2.id).await.unwrap();
        assert_eq!(diff.added, vec!["vet".to_string()]);
        assert_eq!(diff.removed, vec!["review".to_string()]);
        assert_eq!(diff.modified, vec!["start".to_string()]);

        manager.archive(v2.id).await.unwrap();
        let stored = manager.store.get_definition(definition.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn invalid_graphs_cannot_be_published() {
        let manager = manager().await;
        let definition = definition(&manager).await;
        let draft = manager
            .create_draft(definition.id, json!({"nodes": {"start": {"type": "trigger"}}}), None)
            .await
            .unwrap();
        let err = manager.publish(draft.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn migration_maps_active_nodes() {
        let manager = manager().await;
        let definition = definition(&manager).await;
        let v1 = manager.create_draft(definition.id, graph("review"), None).await.unwrap();
        manager.publish(v1.id, None).await.unwrap();
        let v2 = manager.create_draft(definition.id, graph("vet"), None).await.unwrap();
        manager.publish(v2.id, None).await.unwrap();

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_id: v1.id,
            entity_type: "leave".into(),
            entity_id: Some("3".into()),
            status: InstanceStatus::Waiting,
            current_state_id: Some("review".into()),
            previous_state_id: Some("start".into()),
            active_nodes: vec!["review".into()],
            context: json!({}),
            triggered_by: None,
            parent_instance_id: None,
            parent_node_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        manager.store.save_instance(&instance).await.unwrap();
        let gate = ApprovalGateConfig::from_node_config(&json!({
            "approval_type": "any_one",
            "approver": {"type": "static", "member_ids": [8]}
        }))
        .unwrap();
        let approval = manager
            .approvals
            .open_gate(&instance, "review", &gate, &json!({}), None)
            .await
            .unwrap();

        let err = manager
            .migrate_instance(instance.id, v2.id, None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mapping = HashMap::from([("review".to_string(), "vet".to_string())]);
        let migration = manager
            .migrate_instance(instance.id, v2.id, Some(1), Some(mapping), false)
            .await
            .unwrap();
        assert_eq!(migration.migration_type, MigrationType::Manual);

        let moved = manager.store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(moved.version_id, v2.id);
        assert_eq!(moved.active_nodes, vec!["vet".to_string()]);
        assert_eq!(moved.current_state_id.as_deref(), Some("vet"));
        let resolution = manager
            .approvals
            .record_response(approval.id, 8, Decision::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(resolution.approval.node_id, "vet");
        assert_eq!(manager.store.get_approval(approval.id).await.unwrap().unwrap().node_id, "vet");

        let err = manager
            .migrate_instance(instance.id, v1.id, None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let rollback = HashMap::from([("vet".to_string(), "review".to_string())]);
        let migration = manager
            .migrate_instance(instance.id, v1.id, Some(1), Some(rollback), true)
            .await
            .unwrap();
        assert_eq!(migration.migration_type, MigrationType::Admin);
        assert_eq!(manager.store.list_instance_migrations(instance.id).await.unwrap().len(), 2);
    }
}
