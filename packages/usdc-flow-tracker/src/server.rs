//! HTTP API for flow tracking, health and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::state::{FlowSnapshot, TrackRequest};
use crate::types::FlowPollingStatus;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<Metrics>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub flows_in_flight: i64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Failure of an API call, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(OrchestratorError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Orchestrator(
                OrchestratorError::InvalidTransition { .. } | OrchestratorError::AlreadyRunning(_),
            ) => StatusCode::CONFLICT,
            ApiError::Orchestrator(OrchestratorError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Orchestrator(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(error = %message, "API request failed");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        flows_in_flight: state.metrics.flows_in_flight.get(),
    })
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Register a flow and start polling it in the background.
async fn track_flow(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> ApiResult<(StatusCode, Json<FlowSnapshot>)> {
    if request.tx_id.trim().is_empty() {
        return Err(ApiError::BadRequest("tx_id must not be empty".to_string()));
    }
    let snapshot = state.orchestrator.start(request).await?;
    if snapshot.flow_status == FlowPollingStatus::Pending {
        state.orchestrator.spawn(snapshot.tx_id.clone());
    }
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn get_flow(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<Json<FlowSnapshot>> {
    Ok(Json(state.orchestrator.snapshot(&tx_id).await?))
}

async fn cancel_flow(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<Json<FlowSnapshot>> {
    Ok(Json(state.orchestrator.cancel(&tx_id).await?))
}

async fn resume_flow(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FlowSnapshot>)> {
    let snapshot = state.orchestrator.prepare_resume(&tx_id).await?;
    state.orchestrator.spawn(tx_id);
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn retry_flow(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FlowSnapshot>)> {
    let snapshot = state.orchestrator.prepare_retry(&tx_id).await?;
    state.orchestrator.spawn(tx_id);
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn delete_flow(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.orchestrator.forget(&tx_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::NotFound(tx_id).into())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/flows", post(track_flow))
        .route("/flows/{tx_id}", get(get_flow).delete(delete_flow))
        .route("/flows/{tx_id}/cancel", post(cancel_flow))
        .route("/flows/{tx_id}/resume", post(resume_flow))
        .route("/flows/{tx_id}/retry", post(retry_flow))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let app = router(state);

    info!("API server listening on {}", addr);
    info!("  /health  - Health status (JSON)");
    info!("  /metrics - Prometheus metrics");
    info!("  /flows   - Flow tracking");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PollError;
    use crate::metadata::FlowMetadata;
    use crate::orchestrator::OrchestratorConfig;
    use crate::pollers::{PollDispatch, PollParams, PollResult};
    use crate::store::MemoryStateStore;
    use crate::types::FlowType;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Never finds anything; returns once the flow is cancelled.
    struct IdleDispatch;

    #[async_trait]
    impl PollDispatch for IdleDispatch {
        async fn poll(&self, params: PollParams) -> PollResult {
            params.cancel.cancelled().await;
            PollResult {
                success: false,
                found: false,
                metadata: FlowMetadata::default(),
                stages: Vec::new(),
                details: BTreeMap::new(),
                error: Some(PollError::cancelled()),
            }
        }
    }

    fn app_state() -> AppState {
        let metrics = Arc::new(Metrics::new());
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(IdleDispatch),
            OrchestratorConfig::default(),
        )
        .with_metrics(metrics.clone());
        AppState {
            orchestrator: Arc::new(orchestrator),
            metrics,
        }
    }

    fn request(tx_id: &str) -> TrackRequest {
        TrackRequest {
            tx_id: tx_id.to_string(),
            flow_type: FlowType::Payment,
            metadata: FlowMetadata::default(),
            chain_params: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_track_then_cancel() {
        let state = app_state();
        let (status, Json(snapshot)) = track_flow(State(state.clone()), Json(request("0xabc")))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(snapshot.flow_status, FlowPollingStatus::Pending);

        let Json(fetched) = get_flow(State(state.clone()), Path("0xabc".to_string()))
            .await
            .unwrap();
        assert_eq!(fetched.tx_id, "0xabc");

        let Json(cancelled) = cancel_flow(State(state.clone()), Path("0xabc".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.flow_status, FlowPollingStatus::Cancelled);

        let err = retry_flow(State(state), Path("0xabc".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_flow_is_not_found() {
        let state = app_state();
        let err = get_flow(State(state.clone()), Path("0xnope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = delete_flow(State(state), Path("0xnope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_tx_id_rejected() {
        let err = track_flow(State(app_state()), Json(request("  ")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_running_flow() {
        let state = app_state();
        track_flow(State(state.clone()), Json(request("0xdef")))
            .await
            .unwrap();
        let status = delete_flow(State(state.clone()), Path("0xdef".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.orchestrator.is_running("0xdef").await);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = app_state();
        track_flow(State(state.clone()), Json(request("0x123")))
            .await
            .unwrap();
        let response = prometheus_metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
