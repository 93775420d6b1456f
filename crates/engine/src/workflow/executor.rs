use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::WorkflowContext;
use super::graph::{CompiledAction, Node};
use crate::actions::resolve_params;
use crate::metrics::{NODES_EXECUTED_TOTAL, NODE_FAILURES_TOTAL};
use crate::registry::{ActionResult, Registry};
use crate::store::{ExecutionStatus, Store, WorkflowExecutionLog};
use crate::{Error, Result};

/// Runs actions on behalf of the engine and keeps the execution log.
pub struct StepExecutor {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    settings: HashMap<String, String>,
    retry_backoff: Duration,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        settings: HashMap<String, String>,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolve_params(&self, params: &Value, view: &Value) -> Value {
        resolve_params(params, view, &self.settings)
    }

    /// Opens a `running` log row for the next attempt at a node.
    pub async fn begin(&self, instance_id: Uuid, node: &Node, input: Option<Value>) -> Result<WorkflowExecutionLog> {
        let attempt = self.store.count_execution_attempts(instance_id, &node.id).await? + 1;
        let log = WorkflowExecutionLog::running(instance_id, &node.id, node.node_type.as_str(), attempt as i32, input);
        self.store.save_execution_log(&log).await?;
        Ok(log)
    }

    pub async fn finish(
        &self,
        log: &mut WorkflowExecutionLog,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        log.finish(status, output, error);
        self.store.save_execution_log(log).await?;
        match status {
            ExecutionStatus::Completed | ExecutionStatus::Waiting => {
                NODES_EXECUTED_TOTAL.with_label_values(&[&log.node_type]).inc()
            }
            ExecutionStatus::Failed => NODE_FAILURES_TOTAL.with_label_values(&[&log.node_type]).inc(),
            _ => {}
        }
        Ok(())
    }

    /// Logs a node that completes without running an action.
    pub async fn record(&self, instance_id: Uuid, node: &Node, status: ExecutionStatus, output: Option<Value>) -> Result<Uuid> {
        let mut log = self.begin(instance_id, node, None).await?;
        self.finish(&mut log, status, output, None).await?;
        Ok(log.id)
    }

    /// Executes a node's action with up to `max_retries` further attempts, one log row each.
    ///
    /// Backoff doubles per attempt. Non-retryable errors stop immediately.
    pub async fn run_action(
        &self,
        instance_id: Uuid,
        node: &Node,
        action_name: &str,
        params: &Value,
        view: &Value,
    ) -> Result<ActionResult> {
        let action = self
            .registry
            .action(action_name)
            .ok_or_else(|| Error::InvalidDefinition(format!("unknown action '{}'", action_name)))?;
        let resolved = self.resolve_params(params, view);
        let attempts = node.max_retries + 1;

        let mut attempt = 0;
        loop {
            let mut log = self.begin(instance_id, node, Some(resolved.clone())).await?;
            match action.execute(&resolved, view).await {
                Ok(result) => {
                    self.finish(&mut log, ExecutionStatus::Completed, Some(result.output.clone()), None)
                        .await?;
                    debug!("Action {} completed at node {} of instance {}", action_name, node.id, instance_id);
                    return Ok(result);
                }
                Err(e) => {
                    self.finish(&mut log, ExecutionStatus::Failed, None, Some(e.to_string())).await?;
                    attempt += 1;
                    if attempt >= attempts || !e.is_retryable() {
                        warn!(
                            "Action {} failed at node {} of instance {} after {} attempt(s): {}",
                            action_name, node.id, instance_id, attempt, e
                        );
                        return Err(e);
                    }
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    info!(
                        "Retrying action {} at node {} in {:?} (attempt {}/{})",
                        action_name,
                        node.id,
                        delay,
                        attempt + 1,
                        attempts
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Runs enter/exit/edge actions in order, merging their updates into the context.
    ///
    /// `view` rebuilds the evaluation view so later hooks see earlier updates.
    pub async fn run_hooks<F>(&self, owner: &str, hooks: &[CompiledAction], context: &mut WorkflowContext, view: F) -> Result<()>
    where
        F: Fn(&WorkflowContext) -> Value + Send + Sync,
    {
        for hook in hooks {
            let current = view(context);
            if let Some(condition) = &hook.condition {
                if !condition.evaluate(&self.registry, &current) {
                    debug!("Skipping {} hook {}: condition not met", owner, hook.action);
                    continue;
                }
            }
            let action = self
                .registry
                .action(&hook.action)
                .ok_or_else(|| Error::InvalidDefinition(format!("unknown action '{}'", hook.action)))?;
            let params = self.resolve_params(&hook.params, &current);
            let result = action
                .execute(&params, &current)
                .await
                .map_err(|e| Error::Execution(format!("{} hook '{}' failed: {}", owner, hook.action, e)))?;
            context.merge_updates(&result.context_updates);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::LogNotifier;
    use crate::conditions::ConditionRule;
    use crate::registry::{Action, CorePlugin, Plugin, RegistryBuilder};
    use crate::store::{
        create_store, DatabaseConfig, InstanceStatus, VersionStatus, WorkflowDefinition, WorkflowInstance,
        WorkflowVersion,
    };
    use crate::workflow::graph::Graph;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until it has been called `succeed_on` times.
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
        retryable: bool,
    }

    #[async_trait]
    impl Action for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "Fails a fixed number of times"
        }

        async fn execute(&self, _params: &Value, _context: &Value) -> Result<ActionResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(ActionResult::output(json!({"call": call})))
            } else if self.retryable {
                Err(Error::Execution("downstream unavailable".into()))
            } else {
                Err(Error::Validation("bad input".into()))
            }
        }
    }

    struct FlakyPlugin(Arc<Flaky>);

    impl Plugin for FlakyPlugin {
        fn name(&self) -> &str {
            "flaky"
        }

        fn register(&self, registry: &mut RegistryBuilder) -> Result<()> {
            registry.action(self.0.clone())?;
            Ok(())
        }
    }

    fn graph(registry: &Registry, max_retries: u32) -> Graph {
        Graph::from_value(
            &json!({
                "nodes": {
                    "start": {"type": "trigger", "outputs": [{"target": "work"}]},
                    "work": {"type": "action", "config": {"action": "flaky"}, "max_retries": max_retries,
                             "outputs": [{"target": "end"}]},
                    "end": {"type": "end"}
                }
            }),
            registry,
            None,
        )
        .unwrap()
    }

    async fn setup(flaky: Flaky) -> (Arc<dyn Store>, StepExecutor, WorkflowInstance) {
        let store = create_store(&DatabaseConfig::in_memory()).await.unwrap();
        let plugin = FlakyPlugin(Arc::new(flaky));
        let registry = Arc::new(Registry::from_plugins(&[&CorePlugin::new(Arc::new(LogNotifier)), &plugin]).unwrap());

        let definition = WorkflowDefinition::new("Flaky", &format!("flaky-{}", Uuid::new_v4()), "task");
        store.save_definition(&definition).await.unwrap();
        let now = Utc::now();
        let version = WorkflowVersion {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_number: 1,
            definition: json!({}),
            canvas_layout: None,
            status: VersionStatus::Published,
            change_notes: None,
            published_at: Some(now),
            published_by: None,
            created_at: now,
            updated_at: now,
        };
        store.save_version(&version).await.unwrap();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version_id: version.id,
            entity_type: "task".into(),
            entity_id: None,
            status: InstanceStatus::Running,
            current_state_id: Some("work".into()),
            previous_state_id: None,
            active_nodes: vec!["work".into()],
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
        store.save_instance(&instance).await.unwrap();

        let executor = StepExecutor::new(store.clone(), registry, HashMap::new(), 1);
        (store, executor, instance)
    }

    #[tokio::test]
    async fn retries_with_one_log_row_per_attempt() {
        let (store, executor, instance) = setup(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 3,
            retryable: true,
        })
        .await;
        let graph = graph(executor.registry(), 2);
        let node = graph.node("work").unwrap();

        let result = executor
            .run_action(instance.id, node, "flaky", &Value::Null, &json!({}))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"call": 3}));

        let logs = store.list_execution_logs(instance.id).await.unwrap();
        let statuses: Vec<_> = logs.iter().map(|l| (l.attempt_number, l.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (1, ExecutionStatus::Failed),
                (2, ExecutionStatus::Failed),
                (3, ExecutionStatus::Completed)
            ]
        );
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (store, executor, instance) = setup(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 10,
            retryable: true,
        })
        .await;
        let graph = graph(executor.registry(), 1);
        let node = graph.node("work").unwrap();

        let err = executor
            .run_action(instance.id, node, "flaky", &Value::Null, &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("downstream unavailable"));
        assert_eq!(store.count_execution_attempts(instance.id, "work").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let (store, executor, instance) = setup(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 10,
            retryable: false,
        })
        .await;
        let graph = graph(executor.registry(), 5);
        let node = graph.node("work").unwrap();

        assert!(executor
            .run_action(instance.id, node, "flaky", &Value::Null, &json!({}))
            .await
            .is_err());
        assert_eq!(store.count_execution_attempts(instance.id, "work").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hooks_apply_updates_in_order_and_honour_conditions() {
        let (_store, executor, _instance) = setup(Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 1,
            retryable: true,
        })
        .await;
        let hooks = vec![
            CompiledAction {
                action: "set_context".into(),
                params: json!({"key": "status", "value": "hired"}),
                condition: None,
            },
            CompiledAction {
                action: "set_context".into(),
                params: json!({"key": "notified", "value": true}),
                condition: Some(ConditionRule::parse(&json!("status == hired")).unwrap()),
            },
            CompiledAction {
                action: "set_context".into(),
                params: json!({"key": "skipped", "value": true}),
                condition: Some(ConditionRule::Literal(false)),
            },
        ];
        let mut context = WorkflowContext::new("x", json!({}), None);
        executor
            .run_hooks("node 'hire'", &hooks, &mut context, |c| c.as_json().clone())
            .await
            .unwrap();

        assert_eq!(context.get("status"), &json!("hired"));
        assert_eq!(context.get("notified"), &json!(true));
        assert!(context.get("skipped").is_null());
    }
}
