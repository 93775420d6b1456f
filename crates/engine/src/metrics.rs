use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder,
    IntCounter, IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref INSTANCES_STARTED_TOTAL: IntCounter = register_int_counter_with_registry!(
        opts!("workflow_instances_started_total", "Total number of started workflow instances."),
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref INSTANCES_COMPLETED_TOTAL: IntCounter = register_int_counter_with_registry!(
        opts!("workflow_instances_completed_total", "Total number of completed workflow instances."),
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref NODES_EXECUTED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("workflow_nodes_executed_total", "Node executions by node type."),
        &["node_type"],
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref NODE_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("workflow_node_failures_total", "Failed node execution attempts by node type."),
        &["node_type"],
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref APPROVALS_RESOLVED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("workflow_approvals_resolved_total", "Resolved approval gates by final status."),
        &["status"],
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref ESCALATIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("workflow_deadline_escalations_total", "Deadline escalations by action."),
        &["action"],
        REGISTRY
    )
    .expect("metric can be registered");
    pub static ref RESUME_JOBS_FAILED_TOTAL: IntCounter = register_int_counter_with_registry!(
        opts!("workflow_resume_jobs_failed_total", "Resume jobs that exhausted their retries."),
        REGISTRY
    )
    .expect("metric can be registered");
}

// Gather metrics for exposition
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
