//! JSON/HTTP surface for the saga dashboard.
//!
//! Endpoints:
//! - `GET /health`
//! - `GET /executions?flowId&status&startDate&endDate&limit`: execution summaries
//! - `GET /executions/stats?flowId&...&timeRange`: counts, throughput and trends
//! - `GET /executions/{id}`: one execution snapshot
//! - `POST /executions/{id}/pause|resume|cancel`: lifecycle requests
//! - `GET /flows/{flowId}/executions/{executionId|latest}`: execution detail with metrics
//! - `GET /metrics/targets?flowId&targetId&timeRange`: per-target aggregates
//! - `GET /definitions`, `GET|PUT /definitions/{id}`: export and import
//! - `POST /definitions/{id}/executions`: trigger with a JSON payload
//! - `GET /engine/stats`: engine counters

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::definition::SagaDefinition;
use crate::engine::SagaEngine;
use crate::query::{
    ExecutionFilter, ExecutionStats, ExecutionSummary, FlowExecution, QueryError,
    TargetMetricsQuery, TargetMetricsReport,
};
use crate::state::{SagaExecution, SagaStatus};
use crate::stats::EngineStatsSnapshot;
use crate::{EngineError, ExecutionId};

/// Bind `addr` and serve until `shutdown` resolves
pub async fn serve<F>(engine: SagaEngine, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "saga API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Build the axum router (separated for testing).
pub fn router(engine: SagaEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/executions", get(executions))
        .route("/executions/stats", get(execution_stats))
        .route("/executions/{id}", get(execution))
        .route("/executions/{id}/pause", post(pause))
        .route("/executions/{id}/resume", post(resume))
        .route("/executions/{id}/cancel", post(cancel))
        .route("/flows/{flow_id}/executions/{reference}", get(flow_execution))
        .route("/metrics/targets", get(target_metrics))
        .route("/definitions", get(definitions))
        .route("/definitions/{id}", get(definition).put(save_definition))
        .route("/definitions/{id}/executions", post(trigger))
        .route("/engine/stats", get(engine_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}

// ============================================================================
// Errors
// ============================================================================

/// Engine error rendered as `{"error": "..."}` with a matching status code
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::DefinitionNotFound(_)
            | EngineError::ExecutionNotFound(_)
            | EngineError::NoExecutions(_) => StatusCode::NOT_FOUND,
            EngineError::Transition(_) => StatusCode::CONFLICT,
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Query(_) => StatusCode::BAD_REQUEST,
            EngineError::Store(e) => {
                error!(error = %e, "storage failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self.0 {
            EngineError::Validation(e) => json!({
                "error": e.to_string(),
                "issues": e.issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn executions(
    State(engine): State<SagaEngine>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Vec<ExecutionSummary>> {
    Ok(Json(engine.list_executions(&filter)?))
}

async fn execution_stats(
    State(engine): State<SagaEngine>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<ExecutionStats> {
    Ok(Json(engine.execution_stats(&filter)?))
}

async fn execution(
    State(engine): State<SagaEngine>,
    Path(id): Path<u64>,
) -> ApiResult<SagaExecution> {
    Ok(Json(engine.execution(ExecutionId::new(id))?))
}

#[derive(Serialize)]
struct ControlResponse {
    id: ExecutionId,
    status: SagaStatus,
}

async fn pause(State(engine): State<SagaEngine>, Path(id): Path<u64>) -> ApiResult<ControlResponse> {
    let id = ExecutionId::new(id);
    let status = engine.pause(id)?;
    Ok(Json(ControlResponse { id, status }))
}

async fn resume(State(engine): State<SagaEngine>, Path(id): Path<u64>) -> ApiResult<ControlResponse> {
    let id = ExecutionId::new(id);
    let status = engine.resume(id)?;
    Ok(Json(ControlResponse { id, status }))
}

async fn cancel(State(engine): State<SagaEngine>, Path(id): Path<u64>) -> ApiResult<ControlResponse> {
    let id = ExecutionId::new(id);
    let status = engine.cancel(id)?;
    Ok(Json(ControlResponse { id, status }))
}

async fn flow_execution(
    State(engine): State<SagaEngine>,
    Path((flow_id, reference)): Path<(String, String)>,
) -> ApiResult<FlowExecution> {
    Ok(Json(engine.flow_execution(&flow_id, &reference)?))
}

async fn target_metrics(
    State(engine): State<SagaEngine>,
    Query(query): Query<TargetMetricsQuery>,
) -> ApiResult<TargetMetricsReport> {
    Ok(Json(engine.target_metrics(&query)?))
}

async fn definitions(State(engine): State<SagaEngine>) -> Json<Vec<SagaDefinition>> {
    Json(
        engine
            .definitions()
            .iter()
            .map(|d| SagaDefinition::clone(d.as_ref()))
            .collect(),
    )
}

async fn definition(
    State(engine): State<SagaEngine>,
    Path(id): Path<String>,
) -> ApiResult<SagaDefinition> {
    let definition = engine
        .definition(&id)
        .ok_or(EngineError::DefinitionNotFound(id))?;
    Ok(Json(SagaDefinition::clone(&definition)))
}

/// The body is the exported document; the path id wins over the document's
async fn save_definition(
    State(engine): State<SagaEngine>,
    Path(id): Path<String>,
    body: String,
) -> ApiResult<SagaDefinition> {
    let saved = engine.import_definition(&body, Some(&id))?;
    Ok(Json(SagaDefinition::clone(&saved)))
}

async fn trigger(
    State(engine): State<SagaEngine>,
    Path(id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<SagaExecution>), ApiError> {
    let input = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Query(QueryError::InvalidPayload(e.to_string())))?
    };
    let execution = engine.trigger(&id, input)?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn engine_stats(State(engine): State<SagaEngine>) -> Json<EngineStatsSnapshot> {
    Json(engine.stats())
}
