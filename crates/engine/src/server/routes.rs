use axum::{
    extract::{Path, State},
    Json,
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::metrics::gather_metrics;
use crate::scheduler::ResumeJob;
use crate::store::Decision;
use crate::workflow::InstanceState;
use crate::MemberId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponseRequest {
    pub member_id: MemberId,
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub next_approver_id: Option<MemberId>,
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

pub async fn metrics() -> String {
    gather_metrics()
}

/// External re-entry point: the job is queued and handled by the resume worker.
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Json(job): Json<ResumeJob>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    info!("Queueing resume of instance {} at {}", job.instance_id, job.node_id);
    let instance_id = job.instance_id;
    state.queue.enqueue(job).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "queued", "instanceId": instance_id})),
    ))
}

pub async fn respond_to_approval(
    State(state): State<Arc<AppState>>,
    Path(approval_id): Path<Uuid>,
    Json(request): Json<ApprovalResponseRequest>,
) -> Result<Json<Value>, ApiError> {
    let resolution = state
        .engine
        .respond_to_approval(
            approval_id,
            request.member_id,
            request.decision,
            request.comment,
            request.next_approver_id,
        )
        .await?;
    Ok(Json(json!({
        "approvalId": resolution.approval.id,
        "status": resolution.approval.status,
        "outcome": resolution.outcome,
        "port": resolution.port,
        "approvedCount": resolution.approval.approved_count,
        "requiredCount": resolution.approval.required_count,
    })))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<InstanceState>, ApiError> {
    Ok(Json(state.engine.get_instance_state(instance_id).await?))
}
