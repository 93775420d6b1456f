//! Who may see or edit an entity while its workflow sits in a given state.
//!
//! Rules are materialized per (version, state) when a version is published. The evaluator
//! only reads them; it never changes an instance.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::approval::MembershipDirectory;
use crate::conditions::ConditionRule;
use crate::registry::Registry;
use crate::store::{Store, VisibilityRuleType, WorkflowInstance, WorkflowVisibilityRule};
use crate::workflow::WorkflowContext;
use crate::{MemberId, Result};

const ANY: &str = "*";

pub struct VisibilityEvaluator {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    directory: Arc<dyn MembershipDirectory>,
}

impl VisibilityEvaluator {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self {
            store,
            registry,
            directory,
        }
    }

    pub async fn can_view_entity(&self, instance: &WorkflowInstance, member: Option<MemberId>) -> Result<bool> {
        self.entity_access(instance, member, VisibilityRuleType::CanViewEntity).await
    }

    pub async fn can_edit_entity(&self, instance: &WorkflowInstance, member: Option<MemberId>) -> Result<bool> {
        self.entity_access(instance, member, VisibilityRuleType::CanEditEntity).await
    }

    /// `["*"]` when the state restricts no fields.
    pub async fn visible_fields(&self, instance: &WorkflowInstance, member: Option<MemberId>) -> Result<Vec<String>> {
        self.fields(instance, member, VisibilityRuleType::CanViewField).await
    }

    pub async fn editable_fields(&self, instance: &WorkflowInstance, member: Option<MemberId>) -> Result<Vec<String>> {
        self.fields(instance, member, VisibilityRuleType::CanEditField).await
    }

    pub async fn can_view_field(&self, instance: &WorkflowInstance, member: Option<MemberId>, field: &str) -> Result<bool> {
        let fields = self.visible_fields(instance, member).await?;
        Ok(fields.iter().any(|f| f == ANY || f == field))
    }

    pub async fn can_edit_field(&self, instance: &WorkflowInstance, member: Option<MemberId>, field: &str) -> Result<bool> {
        let fields = self.editable_fields(instance, member).await?;
        Ok(fields.iter().any(|f| f == ANY || f == field))
    }

    async fn entity_access(
        &self,
        instance: &WorkflowInstance,
        member: Option<MemberId>,
        rule_type: VisibilityRuleType,
    ) -> Result<bool> {
        let rules: Vec<WorkflowVisibilityRule> = self
            .rules(instance, rule_type)
            .await?
            .into_iter()
            .filter(|r| r.target == ANY)
            .collect();
        if rules.is_empty() {
            return Ok(true);
        }
        let view = self.view(instance, member).await?;
        Ok(rules.iter().any(|rule| self.passes(rule, &view)))
    }

    async fn fields(
        &self,
        instance: &WorkflowInstance,
        member: Option<MemberId>,
        rule_type: VisibilityRuleType,
    ) -> Result<Vec<String>> {
        let rules: Vec<WorkflowVisibilityRule> = self
            .rules(instance, rule_type)
            .await?
            .into_iter()
            .filter(|r| r.target != ANY)
            .collect();
        if rules.is_empty() {
            return Ok(vec![ANY.to_string()]);
        }
        let view = self.view(instance, member).await?;
        let mut fields: Vec<String> = Vec::new();
        for rule in &rules {
            if !fields.contains(&rule.target) && self.passes(rule, &view) {
                fields.push(rule.target.clone());
            }
        }
        Ok(fields)
    }

    /// Rules of one type for the instance's current state, highest priority first.
    async fn rules(&self, instance: &WorkflowInstance, rule_type: VisibilityRuleType) -> Result<Vec<WorkflowVisibilityRule>> {
        let Some(state_id) = &instance.current_state_id else {
            return Ok(Vec::new());
        };
        let mut rules: Vec<WorkflowVisibilityRule> = self
            .store
            .list_visibility_rules(instance.version_id, state_id)
            .await?
            .into_iter()
            .filter(|r| r.rule_type == rule_type)
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn view(&self, instance: &WorkflowInstance, member: Option<MemberId>) -> Result<Value> {
        let profile = match member {
            Some(id) => Some(self.directory.profile(id).await?),
            None => None,
        };
        let context = WorkflowContext::from_json(instance.context.clone());
        Ok(context.evaluation_view(instance, instance.current_state_id.as_deref(), profile.as_ref()))
    }

    fn passes(&self, rule: &WorkflowVisibilityRule, view: &Value) -> bool {
        let Some(raw) = &rule.condition else {
            return true;
        };
        match ConditionRule::parse(raw) {
            Ok(condition) => condition.evaluate(&self.registry, view),
            Err(e) => {
                warn!("Visibility rule {} has an unreadable condition: {}", rule.id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{LogNotifier, MemberProfile, MockMembershipDirectory};
    use crate::registry::CorePlugin;
    use crate::store::{create_store, DatabaseConfig, InstanceStatus, VersionStatus, WorkflowDefinition, WorkflowVersion};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn instance(version_id: Uuid, state: &str) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            version_id,
            entity_type: "officer".into(),
            entity_id: Some("1".into()),
            status: InstanceStatus::Waiting,
            current_state_id: Some(state.into()),
            previous_state_id: None,
            active_nodes: vec![state.into()],
            context: json!({"entity": {"office": "Seneschal"}}),
            triggered_by: None,
            parent_instance_id: None,
            parent_node_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(version_id: Uuid, rule_type: VisibilityRuleType, target: &str, priority: i32, condition: Option<Value>) -> WorkflowVisibilityRule {
        WorkflowVisibilityRule {
            id: Uuid::new_v4(),
            version_id,
            state_id: "review".into(),
            rule_type,
            target: target.into(),
            priority,
            condition,
            created_at: Utc::now(),
        }
    }

    async fn evaluator<F>(rules: F) -> (VisibilityEvaluator, Uuid)
    where
        F: FnOnce(Uuid) -> Vec<WorkflowVisibilityRule>,
    {
        let store = create_store(&DatabaseConfig::in_memory()).await.unwrap();
        let definition = WorkflowDefinition::new("Hire", &format!("hire-{}", Uuid::new_v4()), "officer");
        store.save_definition(&definition).await.unwrap();
        let now = Utc::now();
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_number: 1,
            definition: json!({"nodes": {}}),
            canvas_layout: None,
            status: VersionStatus::Published,
            change_notes: None,
            published_at: Some(now),
            published_by: None,
            created_at: now,
            updated_at: now,
        };
        store.save_version(&version).await.unwrap();
        store.replace_visibility_rules(version.id, &rules(version.id)).await.unwrap();
        let registry = Arc::new(Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier))]).unwrap());

        let mut directory = MockMembershipDirectory::new();
        directory.expect_profile().returning(|member_id| {
            Ok(MemberProfile {
                member_id,
                roles: if member_id == 1 { vec!["Secretary".into()] } else { vec![] },
                ..Default::default()
            })
        });
        (VisibilityEvaluator::new(store, registry, Arc::new(directory)), version.id)
    }

    #[tokio::test]
    async fn entity_rules_allow_when_any_condition_passes() {
        let (evaluator, version_id) = evaluator(|version_id| {
            vec![
                rule(version_id, VisibilityRuleType::CanEditEntity, "*", 10, Some(json!({"role": "Secretary"}))),
                rule(version_id, VisibilityRuleType::CanEditEntity, "*", 1, Some(json!(false))),
            ]
        })
        .await;
        let review = instance(version_id, "review");

        assert!(evaluator.can_edit_entity(&review, Some(1)).await.unwrap());
        assert!(!evaluator.can_edit_entity(&review, Some(2)).await.unwrap());
        assert!(evaluator.can_view_entity(&review, Some(2)).await.unwrap());
        assert!(evaluator
            .can_edit_entity(&instance(version_id, "elsewhere"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn field_rules_list_the_permitted_fields() {
        let (evaluator, version_id) = evaluator(|version_id| {
            vec![
                rule(version_id, VisibilityRuleType::CanViewField, "notes", 5, Some(json!({"role": "Secretary"}))),
                rule(version_id, VisibilityRuleType::CanViewField, "office", 1, None),
            ]
        })
        .await;
        let review = instance(version_id, "review");

        assert_eq!(
            evaluator.visible_fields(&review, Some(1)).await.unwrap(),
            vec!["notes".to_string(), "office".to_string()]
        );
        assert_eq!(evaluator.visible_fields(&review, Some(2)).await.unwrap(), vec!["office".to_string()]);
        assert!(!evaluator.can_view_field(&review, Some(2), "notes").await.unwrap());
        assert_eq!(evaluator.editable_fields(&review, None).await.unwrap(), vec!["*".to_string()]);
        assert!(evaluator.can_edit_field(&review, None, "anything").await.unwrap());
    }
}
