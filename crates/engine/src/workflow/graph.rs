//! Workflow graph format and its compiled form.
//!
//! A version's `definition` JSON is decoded into [`GraphDefinition`], then compiled once
//! into a [`Graph`] with typed node kinds, parsed condition rules and adjacency lists.
//! Compilation validates the graph against the registry, so unknown keys fail at publish
//! or load time rather than mid-execution.

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::state::StateType;
use crate::approval::{ApprovalGateConfig, ApproverRule, EscalationConfig};
use crate::conditions::{parse_duration, ConditionRule};
use crate::registry::{EntityDefinition, Registry};
use crate::store::{TriggerType, VisibilityRuleType};
use crate::{Error, Result};

pub const DEFAULT_PORT: &str = "default";
const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    pub nodes: BTreeMap<String, NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Action,
    Condition,
    Approval,
    State,
    Fork,
    Join,
    Loop,
    Delay,
    Subworkflow,
    End,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Action => "action",
            NodeType::Condition => "condition",
            NodeType::Approval => "approval",
            NodeType::State => "state",
            NodeType::Fork => "fork",
            NodeType::Join => "join",
            NodeType::Loop => "loop",
            NodeType::Delay => "delay",
            NodeType::Subworkflow => "subworkflow",
            NodeType::End => "end",
        }
    }

    pub fn state_type(&self) -> StateType {
        match self {
            NodeType::Trigger => StateType::Initial,
            NodeType::Approval => StateType::Approval,
            NodeType::End => StateType::Terminal,
            _ => StateType::Intermediate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, alias = "onEnterActions")]
    pub on_enter_actions: Vec<ActionRef>,
    #[serde(default, alias = "onExitActions")]
    pub on_exit_actions: Vec<ActionRef>,
    #[serde(default)]
    pub visibility: Vec<VisibilityRuleDefinition>,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
}

/// Action invoked on node entry/exit or while traversing an edge.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionRef {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputDefinition {
    #[serde(default)]
    pub port: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default, alias = "sourcePort", alias = "port")]
    pub source_port: Option<String>,
    #[serde(default, alias = "triggerType")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub conditions: Vec<Value>,
    #[serde(default)]
    pub actions: Vec<ActionRef>,
    #[serde(default, alias = "isDefault")]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VisibilityRuleDefinition {
    pub rule_type: VisibilityRuleType,
    #[serde(default = "wildcard")]
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

fn wildcard() -> String {
    "*".to_string()
}

/// `default`, `next`, `output-N` and a missing port all name the default port.
pub fn normalize_port(port: Option<&str>) -> String {
    match port.map(str::trim) {
        None | Some("") | Some("default") | Some("next") => DEFAULT_PORT.to_string(),
        Some(p) if p.starts_with("output-") && p[7..].chars().all(|c| c.is_ascii_digit()) => {
            DEFAULT_PORT.to_string()
        }
        Some(p) => p.to_string(),
    }
}

/// A condition node's own check, when it has one.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionCheck {
    /// A registered condition invoked with parameters resolved against the context.
    Named { name: String, params: Value },
    Rule(ConditionRule),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DelaySpec {
    For(Duration),
    /// Context path holding the due date.
    Until(String),
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger {
        event: Option<String>,
        entity_id_field: Option<String>,
    },
    Action {
        action: String,
        params: Value,
        is_async: bool,
    },
    Condition {
        check: Option<ConditionCheck>,
    },
    Approval {
        gate: Box<ApprovalGateConfig>,
    },
    State,
    Fork,
    Join,
    Loop {
        max_iterations: u32,
        exit_condition: Option<ConditionRule>,
    },
    Delay {
        wait: DelaySpec,
    },
    Subworkflow {
        definition: String,
        params: Value,
        wait: bool,
    },
    End,
}

#[derive(Debug, Clone)]
pub struct CompiledAction {
    pub action: String,
    pub params: Value,
    pub condition: Option<ConditionRule>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub kind: NodeKind,
    pub label: Option<String>,
    pub config: Value,
    pub on_enter: Vec<CompiledAction>,
    pub on_exit: Vec<CompiledAction>,
    pub visibility: Vec<VisibilityRuleDefinition>,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub port: String,
    pub trigger_type: TriggerType,
    pub conditions: Vec<ConditionRule>,
    pub actions: Vec<CompiledAction>,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    trigger_id: String,
}

/// Collects every problem before failing, so designers see them all at once.
#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, message: String) {
        self.0.push(message);
    }

    fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(Error::InvalidDefinition(message)) => {
                self.push(message);
                None
            }
            Err(other) => {
                self.push(other.to_string());
                None
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidDefinition(self.0.join("; ")))
        }
    }
}

impl GraphDefinition {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidDefinition(format!("malformed workflow graph: {}", e)))
    }
}

fn compile_actions(
    refs: &[ActionRef],
    owner: &str,
    registry: &Registry,
    entity: Option<&EntityDefinition>,
    problems: &mut Problems,
) -> Vec<CompiledAction> {
    refs.iter()
        .filter_map(|r| {
            match registry.action(&r.action) {
                Some(action) => {
                    if let Err(e) = action.validate_params(&r.params, entity) {
                        problems.push(format!("{}: {}", owner, e));
                    }
                }
                None => problems.push(format!("{}: unknown action '{}'", owner, r.action)),
            }
            let condition = match &r.condition {
                Some(raw) => Some(problems.check(compile_rule(raw, owner, registry))?),
                None => None,
            };
            Some(CompiledAction {
                action: r.action.clone(),
                params: r.params.clone(),
                condition,
            })
        })
        .collect()
}

fn compile_rule(raw: &Value, owner: &str, registry: &Registry) -> Result<ConditionRule> {
    let rule = ConditionRule::parse(raw).map_err(|e| Error::InvalidDefinition(format!("{}: {}", owner, e)))?;
    for kind in rule.referenced_kinds() {
        if registry.condition(kind).is_none() {
            return Err(Error::InvalidDefinition(format!("{}: unknown condition type '{}'", owner, kind)));
        }
    }
    Ok(rule)
}

fn config_str(config: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| config.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn compile_condition_check(id: &str, config: &Value, registry: &Registry) -> Result<Option<ConditionCheck>> {
    let owner = format!("condition node '{}'", id);
    match config.get("condition") {
        Some(Value::String(name)) if registry.condition(name).is_some() => Ok(Some(ConditionCheck::Named {
            name: name.clone(),
            params: config.get("params").cloned().unwrap_or(Value::Null),
        })),
        Some(raw) => Ok(Some(ConditionCheck::Rule(compile_rule(raw, &owner, registry)?))),
        None => match config.get("expression") {
            Some(raw) => Ok(Some(ConditionCheck::Rule(compile_rule(raw, &owner, registry)?))),
            None => Ok(None),
        },
    }
}

fn compile_kind(id: &str, def: &NodeDefinition, registry: &Registry) -> Result<NodeKind> {
    let config = &def.config;
    let invalid = |message: String| Error::InvalidDefinition(format!("node '{}': {}", id, message));

    Ok(match def.node_type {
        NodeType::Trigger => {
            let event = config_str(config, &["event"]);
            if let Some(event) = &event {
                if registry.trigger(event).is_none() {
                    return Err(invalid(format!("unknown trigger event '{}'", event)));
                }
            }
            NodeKind::Trigger {
                event,
                entity_id_field: config_str(config, &["entity_id_field", "entityIdField"]),
            }
        }
        NodeType::Action => {
            let name = config_str(config, &["action"]).ok_or_else(|| invalid("missing 'action'".into()))?;
            let action = registry
                .action(&name)
                .ok_or_else(|| invalid(format!("unknown action '{}'", name)))?;
            let params = config.get("params").cloned().unwrap_or(Value::Null);
            let is_async = config
                .get("is_async")
                .or_else(|| config.get("isAsync"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || action.is_async();
            NodeKind::Action {
                action: name,
                params,
                is_async,
            }
        }
        NodeType::Condition => NodeKind::Condition {
            check: compile_condition_check(id, config, registry)?,
        },
        NodeType::Approval => {
            let gate = ApprovalGateConfig::from_node_config(config).map_err(|e| invalid(e.to_string()))?;
            if let ApproverRule::Dynamic { resolver, .. } = &gate.approver {
                if registry.resolver(resolver).is_none() {
                    return Err(invalid(format!("unknown approver resolver '{}'", resolver)));
                }
            }
            if let Some(EscalationConfig::Reassign {
                approver: Some(ApproverRule::Dynamic { resolver, .. }),
                ..
            }) = gate.escalation()?
            {
                if registry.resolver(&resolver).is_none() {
                    return Err(invalid(format!("unknown approver resolver '{}'", resolver)));
                }
            }
            NodeKind::Approval { gate: Box::new(gate) }
        }
        NodeType::State => NodeKind::State,
        NodeType::Fork => NodeKind::Fork,
        NodeType::Join => NodeKind::Join,
        NodeType::Loop => {
            let max_iterations = config
                .get("max_iterations")
                .or_else(|| config.get("maxIterations"))
                .map(|v| v.as_u64().unwrap_or(0) as u32)
                .unwrap_or(DEFAULT_MAX_ITERATIONS);
            if max_iterations == 0 {
                return Err(invalid("loop max_iterations must be greater than 0".into()));
            }
            let exit_condition = match config.get("exit_condition").or_else(|| config.get("exitCondition")) {
                Some(raw) => Some(compile_rule(raw, &format!("loop node '{}'", id), registry)?),
                None => None,
            };
            NodeKind::Loop {
                max_iterations,
                exit_condition,
            }
        }
        NodeType::Delay => {
            let wait = match (config.get("duration"), config_str(config, &["until"])) {
                (Some(Value::Number(n)), _) => DelaySpec::For(Duration::seconds(n.as_i64().unwrap_or(0))),
                (Some(Value::String(s)), _) => DelaySpec::For(
                    parse_duration(s).ok_or_else(|| invalid(format!("invalid delay duration '{}'", s)))?,
                ),
                (_, Some(path)) => DelaySpec::Until(path),
                _ => return Err(invalid("delay needs a 'duration' or 'until'".into())),
            };
            NodeKind::Delay { wait }
        }
        NodeType::Subworkflow => NodeKind::Subworkflow {
            definition: config_str(config, &["definition", "workflowSlug", "workflow_slug"])
                .ok_or_else(|| invalid("subworkflow needs a 'definition' slug".into()))?,
            params: config.get("params").cloned().unwrap_or(Value::Null),
            wait: config.get("wait").and_then(Value::as_bool).unwrap_or(true),
        },
        NodeType::End => NodeKind::End,
    })
}

impl Graph {
    /// Decodes and compiles a stored definition.
    pub fn from_value(value: &Value, registry: &Registry, entity: Option<&EntityDefinition>) -> Result<Self> {
        Self::compile(&GraphDefinition::from_value(value)?, registry, entity)
    }

    pub fn compile(
        definition: &GraphDefinition,
        registry: &Registry,
        entity: Option<&EntityDefinition>,
    ) -> Result<Self> {
        let mut problems = Problems::default();

        let mut nodes = BTreeMap::new();
        for (id, def) in &definition.nodes {
            let kind = match problems.check(compile_kind(id, def, registry)) {
                Some(kind) => kind,
                None => continue,
            };
            if let NodeKind::Action { action, params, .. } = &kind {
                if let Some(action) = registry.action(action) {
                    if let Err(e) = action.validate_params(params, entity) {
                        problems.push(format!("node '{}': {}", id, e));
                    }
                }
            }
            let owner = format!("node '{}'", id);
            nodes.insert(
                id.clone(),
                Node {
                    id: id.clone(),
                    node_type: def.node_type,
                    kind,
                    label: def.label.clone(),
                    config: def.config.clone(),
                    on_enter: compile_actions(&def.on_enter_actions, &owner, registry, entity, &mut problems),
                    on_exit: compile_actions(&def.on_exit_actions, &owner, registry, entity, &mut problems),
                    visibility: def.visibility.clone(),
                    max_retries: def.max_retries,
                },
            );
        }

        let triggers: Vec<&String> = definition
            .nodes
            .iter()
            .filter(|(_, n)| n.node_type == NodeType::Trigger)
            .map(|(id, _)| id)
            .collect();
        if triggers.len() != 1 {
            problems.push(format!("graph must have exactly one trigger node, found {}", triggers.len()));
        }
        if !definition.nodes.values().any(|n| n.node_type == NodeType::End) {
            problems.push("graph must have at least one end node".to_string());
        }

        let per_node_outputs = definition.nodes.iter().flat_map(|(id, node)| {
            node.outputs.iter().map(move |output| EdgeDefinition {
                id: None,
                source: id.clone(),
                target: output.target.clone(),
                source_port: output.port.clone(),
                trigger_type: TriggerType::Automatic,
                conditions: Vec::new(),
                actions: Vec::new(),
                is_default: false,
            })
        });
        let all_edges: Vec<EdgeDefinition> = definition.edges.iter().cloned().chain(per_node_outputs).collect();

        let mut edges = Vec::with_capacity(all_edges.len());
        for (index, def) in all_edges.iter().enumerate() {
            let id = def.id.clone().unwrap_or_else(|| format!("e{}", index));
            let owner = format!("edge '{}'", id);
            for endpoint in [&def.source, &def.target] {
                if !definition.nodes.contains_key(endpoint) {
                    problems.push(format!("{} references unknown node '{}'", owner, endpoint));
                }
            }
            let conditions = def
                .conditions
                .iter()
                .filter_map(|raw| problems.check(compile_rule(raw, &owner, registry)))
                .collect();
            edges.push(Edge {
                id,
                source: def.source.clone(),
                target: def.target.clone(),
                port: normalize_port(def.source_port.as_deref()),
                trigger_type: def.trigger_type,
                conditions,
                actions: compile_actions(&def.actions, &owner, registry, entity, &mut problems),
                is_default: def.is_default,
            });
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(index);
            incoming.entry(edge.target.clone()).or_default().push(index);
        }

        let trigger_id = triggers.first().map(|id| id.to_string()).unwrap_or_default();
        if !trigger_id.is_empty() {
            let mut seen = BTreeSet::new();
            let mut queue = VecDeque::from([trigger_id.clone()]);
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                for index in outgoing.get(&id).into_iter().flatten() {
                    queue.push_back(edges[*index].target.clone());
                }
            }
            for id in definition.nodes.keys() {
                if !seen.contains(id) {
                    problems.push(format!("node '{}' is not reachable from the trigger", id));
                }
            }
        }

        problems.finish()?;
        Ok(Self {
            nodes,
            edges,
            outgoing,
            incoming,
            trigger_id,
        })
    }

    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    pub fn trigger_event(&self) -> Option<&str> {
        match self.nodes.get(&self.trigger_id).map(|n| &n.kind) {
            Some(NodeKind::Trigger { event, .. }) => event.as_deref(),
            _ => None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Outgoing edges in declaration order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |index| &self.edges[*index])
    }

    /// Distinct nodes with an edge into `id`.
    pub fn incoming_sources(&self, id: &str) -> BTreeSet<&str> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(|index| self.edges[*index].source.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::LogNotifier;
    use crate::registry::{CorePlugin, FieldSpec, FieldType, Plugin, RegistryBuilder, TriggerDefinition};
    use serde_json::json;
    use std::sync::Arc;

    struct Officers;

    impl Plugin for Officers {
        fn name(&self) -> &str {
            "officers"
        }

        fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
            registry.trigger(
                TriggerDefinition::new("Officers.HireRequested", "Hire requested")
                    .with_field("officeId", FieldSpec::required(FieldType::Integer)),
            )?;
            Ok(())
        }
    }

    fn registry() -> Registry {
        Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier)), &Officers]).unwrap()
    }

    fn hire_graph() -> Value {
        json!({
            "nodes": {
                "start": {"type": "trigger", "config": {"event": "Officers.HireRequested"},
                          "outputs": [{"port": "default", "target": "create_officer"}]},
                "create_officer": {"type": "action",
                                   "config": {"action": "set_context", "params": {"key": "officer", "value": "$.trigger"}}},
                "needs_warrant": {"type": "condition", "config": {"expression": "trigger.requiresWarrant == true"}},
                "approval": {"type": "approval",
                             "config": {"approver": {"type": "static", "member_ids": [42]}}},
                "end": {"type": "end"}
            },
            "edges": [
                {"from": "create_officer", "to": "needs_warrant", "port": "next"},
                {"source": "needs_warrant", "target": "approval", "sourcePort": "true"},
                {"source": "needs_warrant", "target": "end", "sourcePort": "false"},
                {"source": "approval", "target": "end", "sourcePort": "approved"},
                {"source": "approval", "target": "end", "sourcePort": "rejected"}
            ]
        })
    }

    #[test]
    fn compiles_a_valid_graph() {
        let graph = Graph::from_value(&hire_graph(), &registry(), None).unwrap();
        assert_eq!(graph.trigger_id(), "start");
        assert_eq!(graph.trigger_event(), Some("Officers.HireRequested"));
        assert_eq!(graph.outgoing("start").next().unwrap().port, "default");
        assert_eq!(graph.outgoing("create_officer").next().unwrap().port, "default");
        assert!(matches!(
            graph.node("needs_warrant").unwrap().kind,
            NodeKind::Condition { check: Some(ConditionCheck::Rule(_)) }
        ));
        assert_eq!(graph.incoming_sources("end").into_iter().collect::<Vec<_>>(), vec!["approval", "needs_warrant"]);
        assert_eq!(graph.node("approval").unwrap().node_type.state_type(), StateType::Approval);
    }

    #[test]
    fn normalizes_equivalent_ports() {
        for port in [None, Some("default"), Some("next"), Some("output-1"), Some("")] {
            assert_eq!(normalize_port(port), "default");
        }
        assert_eq!(normalize_port(Some("output-a")), "output-a");
        assert_eq!(normalize_port(Some("approved")), "approved");
    }

    #[test]
    fn reports_every_problem() {
        let graph = json!({
            "nodes": {
                "start": {"type": "trigger", "config": {"event": "Nobody.Registered"}},
                "orphan": {"type": "action", "config": {"action": "launch_rockets"}},
                "loop": {"type": "loop", "config": {"max_iterations": 0}},
                "gate": {"type": "approval", "config": {"approver": {"type": "dynamic", "resolver": "nope"}}},
                "check": {"type": "condition", "config": {"condition": {"type": "unregistered"}}}
            },
            "edges": [{"source": "start", "target": "ghost"}]
        });
        let err = Graph::from_value(&graph, &registry(), None).unwrap_err().to_string();
        for expected in [
            "unknown trigger event 'Nobody.Registered'",
            "unknown action 'launch_rockets'",
            "max_iterations must be greater than 0",
            "unknown approver resolver 'nope'",
            "unknown condition type 'unregistered'",
            "at least one end node",
            "unknown node 'ghost'",
            "not reachable",
        ] {
            assert!(err.contains(expected), "missing '{}' in {}", expected, err);
        }
    }

    #[test]
    fn set_field_targets_are_checked_against_the_entity() {
        let officer = EntityDefinition::new("officer", "Officer")
            .with_field("status", FieldSpec::optional(FieldType::String));
        let graph = json!({
            "nodes": {
                "start": {"type": "trigger", "outputs": [{"target": "update"}]},
                "update": {"type": "action", "config": {"action": "set_field", "params": {"field": "colour", "value": 1}},
                           "outputs": [{"target": "end"}]},
                "end": {"type": "end"}
            }
        });
        assert!(Graph::from_value(&graph, &registry(), None).is_ok());
        let err = Graph::from_value(&graph, &registry(), Some(&officer)).unwrap_err();
        assert!(err.to_string().contains("no field 'colour'"));
    }

    #[test]
    fn malformed_json_is_a_definition_error() {
        let err = Graph::from_value(&json!({"nodes": {"a": {"type": "teleport"}}}), &registry(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }
}
