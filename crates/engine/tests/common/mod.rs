#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use workflow_engine::{
    config::Config,
    registry::{Action, ActionResult, EntityDefinition, FieldSpec, FieldType, Plugin, RegistryBuilder, TriggerDefinition},
    services::Services,
    store::WorkflowDefinition,
    Error, Result,
};

pub const HIRE_REQUESTED: &str = "Officers.HireRequested";

/// Creates the officer record from the hire request.
struct CreateOfficer;

#[async_trait]
impl Action for CreateOfficer {
    fn name(&self) -> &str {
        "create_officer"
    }

    async fn execute(&self, _params: &Value, context: &Value) -> Result<ActionResult> {
        let request = &context["trigger"];
        let officer = json!({
            "officeId": request["officeId"],
            "memberId": request["memberId"],
            "requiresWarrant": request["requiresWarrant"].as_bool().unwrap_or(false),
        });
        Ok(ActionResult::output(json!({"created": true})).with_update("officer", officer))
    }
}

static FAILED_KEYS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Fails the first call for each `key` param and succeeds after that.
struct FailOnce;

#[async_trait]
impl Action for FailOnce {
    fn name(&self) -> &str {
        "fail_once"
    }

    async fn execute(&self, params: &Value, _context: &Value) -> Result<ActionResult> {
        let key = params["key"].as_str().unwrap_or_default().to_string();
        let mut failed = FAILED_KEYS.lock().unwrap();
        if failed.contains(&key) {
            return Ok(ActionResult::output(json!({"key": key})).with_update("recovered", json!(true)));
        }
        failed.push(key);
        Err(Error::Execution("upstream unavailable".to_string()))
    }
}

pub struct OfficersPlugin;

impl Plugin for OfficersPlugin {
    fn name(&self) -> &str {
        "officers"
    }

    fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
        registry
            .trigger(
                TriggerDefinition::new(HIRE_REQUESTED, "Officer hire requested")
                    .with_field("officeId", FieldSpec::required(FieldType::Integer))
                    .with_field("memberId", FieldSpec::required(FieldType::Integer))
                    .with_field("requiresWarrant", FieldSpec::optional(FieldType::Boolean)),
            )?
            .entity(
                EntityDefinition::new("officer", "Officer")
                    .with_field("officeId", FieldSpec::required(FieldType::Integer)),
            )?
            .action(Arc::new(CreateOfficer))?
            .action(Arc::new(FailOnce))?;
        Ok(())
    }
}

pub async fn services() -> Services {
    Services::build_with_plugins(&Config::in_memory(), &[&OfficersPlugin])
        .await
        .unwrap()
}

/// Saves a definition for `graph` and publishes its first version. Returns the slug and
/// the version id.
pub async fn publish(services: &Services, entity_type: &str, graph: Value) -> (String, Uuid) {
    let slug = format!("flow-{}", Uuid::new_v4());
    let definition = WorkflowDefinition::new("Flow", &slug, entity_type);
    services.store.save_definition(&definition).await.unwrap();
    let draft = services
        .versions
        .create_draft(definition.id, graph, None)
        .await
        .unwrap();
    let published = services.versions.publish(draft.id, Some(1)).await.unwrap();
    (slug, published.id)
}

/// start -> create_officer -> needs_warrant? -> warrant approval -> end
pub fn officer_hire_graph(approvers: &[i64]) -> Value {
    json!({
        "nodes": {
            "start": {
                "type": "trigger",
                "config": {"event": HIRE_REQUESTED, "entity_id_field": "memberId"},
                "outputs": [{"target": "create_officer"}]
            },
            "create_officer": {
                "type": "action",
                "config": {"action": "create_officer"},
                "outputs": [{"target": "needs_warrant"}]
            },
            "needs_warrant": {
                "type": "condition",
                "config": {"expression": "$.officer.requiresWarrant == true"}
            },
            "warrant": {
                "type": "approval",
                "config": {
                    "approval_type": "any_one",
                    "approver": {"type": "static", "member_ids": approvers}
                }
            },
            "end": {"type": "end"}
        },
        "edges": [
            {"source": "needs_warrant", "target": "warrant", "port": "true"},
            {"source": "needs_warrant", "target": "end", "port": "false"},
            {"source": "warrant", "target": "end", "port": "approved"},
            {"source": "warrant", "target": "end", "port": "rejected"}
        ]
    })
}

pub fn gate_graph(gate_config: Value) -> Value {
    json!({
        "nodes": {
            "start": {"type": "trigger", "outputs": [{"target": "gate"}]},
            "gate": {"type": "approval", "config": gate_config},
            "granted": {"type": "end"},
            "refused": {"type": "end"},
            "lapsed": {"type": "end"}
        },
        "edges": [
            {"source": "gate", "target": "granted", "port": "approved"},
            {"source": "gate", "target": "refused", "port": "rejected"},
            {"source": "gate", "target": "lapsed", "port": "expired"}
        ]
    })
}
