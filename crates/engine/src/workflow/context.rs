use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::approval::MemberProfile;
use crate::conditions::{resolve_path, set_path, value_to_datetime};
use crate::store::WorkflowInstance;
use crate::MemberId;

const INTERNAL: &str = "_internal";

/// The accumulated data of one instance, persisted as `WorkflowInstance.context`.
///
/// Layout: `trigger`, `triggeredBy`, `event`, `entity`, `nodes.<id>` (per-node results),
/// `resumeData`, `approval_gates.<id>`, plus whatever actions write. Engine bookkeeping
/// (join arrivals, loop counters, delays, state entry times) lives under `_internal`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowContext {
    data: Value,
}

impl WorkflowContext {
    pub fn new(event: &str, payload: Value, triggered_by: Option<MemberId>) -> Self {
        let entity = match payload.get("entity") {
            Some(entity) if entity.is_object() => entity.clone(),
            _ => payload.clone(),
        };
        Self {
            data: json!({
                "trigger": payload,
                "triggeredBy": triggered_by,
                "event": event,
                "entity": entity,
                "nodes": {},
                "_internal": {},
            }),
        }
    }

    /// Wraps a stored context. Non-object values are replaced by an empty context.
    pub fn from_json(value: Value) -> Self {
        let data = if value.is_object() { value } else { json!({}) };
        Self { data }
    }

    pub fn as_json(&self) -> &Value {
        &self.data
    }

    pub fn into_json(self) -> Value {
        self.data
    }

    pub fn get(&self, path: &str) -> &Value {
        resolve_path(&self.data, path)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.data, path, value);
    }

    /// Applies action `context_updates`; keys are dot paths.
    pub fn merge_updates(&mut self, updates: &Map<String, Value>) {
        for (path, value) in updates {
            set_path(&mut self.data, path, value.clone());
        }
    }

    pub fn record_node(&mut self, node_id: &str, record: Value) {
        self.nodes_mut().insert(node_id.to_string(), record);
    }

    pub fn node_record(&self, node_id: &str) -> &Value {
        resolve_path(&self.data, "nodes").get(node_id).unwrap_or(&Value::Null)
    }

    /// Merges resume data and records the resumed node as `{status: port, ...data}`.
    pub fn record_resume(&mut self, node_id: &str, port: &str, data: &Value) {
        let mut record = Map::new();
        record.insert("status".to_string(), Value::String(port.to_string()));
        if let Value::Object(fields) = data {
            for (key, value) in fields {
                record.insert(key.clone(), value.clone());
            }
        }
        self.record_node(node_id, Value::Object(record));

        if data.is_null() {
            return;
        }
        if let (Some(Value::Object(existing)), Value::Object(fields)) = (self.data.get_mut("resumeData"), data) {
            for (key, value) in fields {
                existing.insert(key.clone(), value.clone());
            }
            return;
        }
        self.set("resumeData", data.clone());
    }

    pub fn record_gate(&mut self, node_id: &str, is_met: bool, status: &str) {
        self.set(
            &format!("approval_gates.{}", node_id),
            json!({"is_met": is_met, "status": status}),
        );
    }

    pub fn internal(&self, key: &str) -> &Value {
        resolve_path(&self.data, INTERNAL).get(key).unwrap_or(&Value::Null)
    }

    pub fn set_internal(&mut self, key: &str, value: Value) {
        self.internal_mut().insert(key.to_string(), value);
    }

    pub fn remove_internal(&mut self, key: &str) -> Option<Value> {
        self.internal_mut().remove(key)
    }

    /// A map-shaped internal entry, created on first use.
    pub fn internal_map(&mut self, key: &str) -> &mut Map<String, Value> {
        as_object(self.internal_mut().entry(key.to_string()).or_insert(Value::Null))
    }

    pub fn mark_state_entered(&mut self, node_id: &str, at: DateTime<Utc>) {
        self.internal_map("state_entered_at")
            .insert(node_id.to_string(), Value::String(at.to_rfc3339()));
    }

    pub fn state_entered_at(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.internal("state_entered_at")
            .get(node_id)
            .and_then(value_to_datetime)
    }

    /// The view conditions evaluate against: the context plus the acting member and instance.
    pub fn evaluation_view(
        &self,
        instance: &WorkflowInstance,
        node_id: Option<&str>,
        actor: Option<&MemberProfile>,
    ) -> Value {
        let mut view = self.data.clone();
        let Value::Object(map) = &mut view else {
            return view;
        };

        match actor {
            Some(profile) => {
                map.insert("user_id".to_string(), json!(profile.member_id));
                map.insert("user_permissions".to_string(), json!(profile.permissions));
                map.insert("user_roles".to_string(), json!(profile.roles));
                map.insert(
                    "user_managed_member_ids".to_string(),
                    json!(profile.managed_member_ids),
                );
            }
            None => {
                map.insert("user_id".to_string(), Value::Null);
                map.insert("user_permissions".to_string(), json!([]));
                map.insert("user_roles".to_string(), json!([]));
                map.insert("user_managed_member_ids".to_string(), json!([]));
            }
        }

        map.insert(
            "instance".to_string(),
            json!({
                "id": instance.id,
                "status": instance.status,
                "entity_type": instance.entity_type,
                "entity_id": instance.entity_id,
                "current_state_id": instance.current_state_id,
                "previous_state_id": instance.previous_state_id,
                "context": self.data,
            }),
        );

        let entered_at = node_id
            .and_then(|id| self.state_entered_at(id))
            .map(|at| Value::String(at.to_rfc3339()))
            .unwrap_or(Value::Null);
        map.insert("state_entered_at".to_string(), entered_at);
        view
    }

    fn nodes_mut(&mut self) -> &mut Map<String, Value> {
        self.object_at("nodes")
    }

    fn internal_mut(&mut self) -> &mut Map<String, Value> {
        self.object_at(INTERNAL)
    }

    fn object_at(&mut self, key: &str) -> &mut Map<String, Value> {
        as_object(as_object(&mut self.data).entry(key.to_string()).or_insert(Value::Null))
    }
}

/// Replaces a non-object with an empty object and borrows the map.
fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just made an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InstanceStatus;
    use uuid::Uuid;

    fn instance() -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            entity_type: "officer".into(),
            entity_id: Some("7".into()),
            status: InstanceStatus::Running,
            current_state_id: Some("review".into()),
            previous_state_id: None,
            active_nodes: vec!["review".into()],
            context: json!({}),
            triggered_by: Some(1),
            parent_instance_id: None,
            parent_node_id: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn initial_layout_prefers_the_entity_object() {
        let context = WorkflowContext::new("Officers.HireRequested", json!({"entity": {"id": 7}, "officeId": 3}), Some(1));
        assert_eq!(context.get("entity.id"), &json!(7));
        assert_eq!(context.get("trigger.officeId"), &json!(3));
        assert_eq!(context.get("triggeredBy"), &json!(1));

        let context = WorkflowContext::new("x", json!({"officeId": 3}), None);
        assert_eq!(context.get("entity.officeId"), &json!(3));
        assert!(context.get("nodes").is_object());
    }

    #[test]
    fn resume_merges_data_and_records_the_port() {
        let mut context = WorkflowContext::new("x", json!({}), None);
        context.record_resume("approval", "approved", &json!({"approverId": 42}));
        context.record_resume("approval", "approved", &json!({"comment": "fine"}));

        assert_eq!(context.node_record("approval"), &json!({"status": "approved", "comment": "fine"}));
        assert_eq!(context.get("resumeData"), &json!({"approverId": 42, "comment": "fine"}));
    }

    #[test]
    fn dot_path_updates_and_internal_state() {
        let mut context = WorkflowContext::from_json(json!("not an object"));
        let mut updates = Map::new();
        updates.insert("variables.count".to_string(), json!(2));
        context.merge_updates(&updates);
        assert_eq!(context.get("variables.count"), &json!(2));

        context.internal_map("joinState").insert("join".into(), json!(["a"]));
        assert_eq!(context.internal("joinState"), &json!({"join": ["a"]}));
        assert_eq!(context.remove_internal("joinState"), Some(json!({"join": ["a"]})));
    }

    #[test]
    fn evaluation_view_carries_actor_and_state_entry() {
        let mut context = WorkflowContext::new("x", json!({}), None);
        let entered = Utc::now();
        context.mark_state_entered("review", entered);
        let profile = MemberProfile {
            member_id: 5,
            permissions: vec!["Officers.hire".into()],
            ..Default::default()
        };

        let view = context.evaluation_view(&instance(), Some("review"), Some(&profile));
        assert_eq!(view["user_id"], json!(5));
        assert_eq!(view["user_permissions"], json!(["Officers.hire"]));
        assert_eq!(view["instance"]["current_state_id"], json!("review"));
        assert_eq!(view["state_entered_at"], json!(entered.to_rfc3339()));

        let anonymous = context.evaluation_view(&instance(), None, None);
        assert!(anonymous["user_id"].is_null());
    }
}
