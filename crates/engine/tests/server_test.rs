mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use common::{gate_graph, publish, services};
use workflow_engine::store::InstanceStatus;

#[tokio::test]
async fn test_server_endpoints() {
    let services = services().await;
    let client = TestServer::new(services.server().build_router()).unwrap();

    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = client.get(&format!("/instances/{}", Uuid::new_v4())).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn approval_responses_resolve_the_gate() {
    let services = services().await;
    let (slug, _) = publish(
        &services,
        "task",
        gate_graph(json!({
            "approval_type": "threshold",
            "required_count": 2,
            "approver": {"type": "static", "member_ids": [1, 2, 3]}
        })),
    )
    .await;
    let id = services.engine.start_workflow(&slug, "manual", json!({}), None).await.unwrap();
    let client = TestServer::new(services.server().build_router()).unwrap();

    let response = client.get(&format!("/instances/{}", id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let state: Value = response.json();
    assert_eq!(state["status"], "waiting");
    let gate = state["pending_approvals"][0]["id"].as_str().unwrap().to_string();

    let response = client
        .post(&format!("/approvals/{}/responses", gate))
        .json(&json!({"memberId": 1, "decision": "approve"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["approvedCount"], 1);
    assert_eq!(body["requiredCount"], 2);

    let response = client
        .post(&format!("/approvals/{}/responses", gate))
        .json(&json!({"memberId": 1, "decision": "approve"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    let response = client
        .post(&format!("/approvals/{}/responses", gate))
        .json(&json!({"memberId": 8, "decision": "approve"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = client
        .post(&format!("/approvals/{}/responses", gate))
        .json(&json!({"memberId": 3, "decision": "approve", "comment": "fine by me"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "approved");
    assert_eq!(body["port"], "approved");

    let state: Value = client.get(&format!("/instances/{}", id)).await.json();
    assert_eq!(state["status"], "completed");
    assert_eq!(state["current_state_id"], "granted");
}

#[tokio::test]
async fn queued_resume_is_picked_up_by_the_worker() {
    let mut services = services().await;
    let (slug, _) = publish(
        &services,
        "task",
        json!({
            "nodes": {
                "start": {"type": "trigger", "outputs": [{"target": "review"}]},
                "review": {"type": "state"},
                "end": {"type": "end"}
            },
            "edges": [{"source": "review", "target": "end", "trigger_type": "event"}]
        }),
    )
    .await;
    let id = services.engine.start_workflow(&slug, "manual", json!({}), None).await.unwrap();
    assert_eq!(
        services.engine.get_instance_state(id).await.unwrap().status,
        InstanceStatus::Waiting
    );

    let worker = services.spawn_resume_worker().unwrap();
    assert!(services.spawn_resume_worker().is_none());
    let client = TestServer::new(services.server().build_router()).unwrap();

    let response = client
        .post("/resume")
        .json(&json!({"instanceId": id, "nodeId": "review", "additionalData": {"reviewed": true}}))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["status"], "queued");

    let mut status = InstanceStatus::Waiting;
    for _ in 0..100 {
        status = services.engine.get_instance_state(id).await.unwrap().status;
        if status == InstanceStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, InstanceStatus::Completed);
    worker.abort();
}
