use crate::state::Readiness;
use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;

pub async fn readiness_probe(State(readiness): State<Arc<Readiness>>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(readiness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadKind;

    #[tokio::test]
    async fn test_readiness_follows_sync_state() {
        let readiness = Arc::new(Readiness::default());

        let response = readiness_probe(State(readiness.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_synced(WorkloadKind::Deployment);
        readiness.mark_synced(WorkloadKind::StatefulSet);

        let response = readiness_probe(State(readiness)).await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_liveness_is_always_ok() {
        let response = liveness_probe().await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
