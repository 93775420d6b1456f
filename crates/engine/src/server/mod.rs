mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{scheduler::ResumeQueue, workflow::WorkflowEngine, Error, Result};

pub use routes::ApprovalResponseRequest;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub queue: Arc<dyn ResumeQueue>,
}

pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(engine: Arc<WorkflowEngine>, queue: Arc<dyn ResumeQueue>) -> Self {
        Self {
            state: Arc::new(AppState { engine, queue }),
        }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/resume", post(routes::resume))
            .route("/approvals/{id}/responses", post(routes::respond_to_approval))
            .route("/instances/{id}", get(routes::get_instance))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }

    pub async fn start(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {}", addr);
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }
}

/// Maps engine errors onto HTTP status codes.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_)
            | Error::DefinitionNotFound(_)
            | Error::InstanceNotFound(_)
            | Error::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
            Error::InstanceAlreadyCompleted(_)
            | Error::NodeMismatch { .. }
            | Error::DuplicateInstance { .. }
            | Error::DuplicateResponse { .. }
            | Error::ApprovalNotPending(_) => StatusCode::CONFLICT,
            Error::NotEligible { .. } => StatusCode::FORBIDDEN,
            Error::Validation(_) | Error::InvalidPayload { .. } | Error::NoPublishedVersion(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NoMatchingTransition { .. } | Error::InvalidDefinition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn refusals_map_to_client_errors() {
        let id = Uuid::new_v4();
        let status = |e: Error| ApiError(e).into_response().status();
        assert_eq!(status(Error::InstanceNotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::DuplicateResponse {
                approval_id: id,
                member_id: 3
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Error::NotEligible {
                approval_id: id,
                member_id: 3
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status(Error::Internal("db".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
