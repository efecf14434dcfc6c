use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use loadmesh_core::model::SlaveInfo;
use loadmesh_core::scheduler::SelectionCriteria;
use loadmesh_core::transport::Envelope;
use serde::Deserialize;

use crate::state::SharedState;

fn error_response(err: loadmesh_core::Error) -> (StatusCode, Json<loadmesh_core::error::ErrorResponse>) {
    let status = match err.kind() {
        loadmesh_core::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        loadmesh_core::ErrorKind::Validation | loadmesh_core::ErrorKind::Parsing => StatusCode::BAD_REQUEST,
        loadmesh_core::ErrorKind::Conflict => StatusCode::CONFLICT,
        loadmesh_core::ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        loadmesh_core::ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        loadmesh_core::ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err.to_response()))
}

/// Liveness probe for slaves deciding whether the master is reachable
/// before attempting registration.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn list_slaves(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

pub async fn register_slave(
    State(state): State<SharedState>,
    Json(info): Json<SlaveInfo>,
) -> impl IntoResponse {
    let slave = state.registry.register(info).await;
    (StatusCode::CREATED, Json(serde_json::json!({ "slave_id": slave.info.id })))
}

pub async fn unregister_slave(
    State(state): State<SharedState>,
    Path(slave_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.deregister(&slave_id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error_response(loadmesh_core::Error::NotFound(format!("slave {slave_id}"))).into_response(),
    }
}

/// HTTP-poll transport endpoint: a single round trip both ships whatever
/// the slave is carrying and returns the next pending envelope, if any
/// (currently just acknowledges — outbound commands queue in
/// `ConnectionTable` and are drained here instead of pushed proactively).
pub async fn poll_slave(
    State(state): State<SharedState>,
    Path(slave_id): Path<String>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    match envelope {
        Envelope::Heartbeat(status) => {
            if let Err(err) = state.registry.heartbeat(&slave_id, status).await {
                return error_response(err).into_response();
            }
        }
        Envelope::ResultBatch { results, metrics } => {
            tracing::info!(slave_id, results = results.len(), metrics = metrics.len(), "poll result batch");
        }
        Envelope::Progress { execution_id, slave_id, state: slave_state } => {
            if let Err(err) = state
                .coordinator
                .record_slave_progress(&execution_id, &slave_id, slave_state)
                .await
            {
                tracing::warn!(%err, execution_id, slave_id, "failed to record polled progress");
            }
        }
        Envelope::Ping => return Json(Envelope::Pong).into_response(),
        _ => {}
    }
    Json(Envelope::HeartbeatAck).into_response()
}

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub workflow_id: String,
    pub workflow: serde_json::Value,
    pub options: loadmesh_core::model::TaskOptions,
    #[serde(default)]
    pub criteria: SelectionCriteria,
}

pub async fn start_execution(
    State(state): State<SharedState>,
    Json(request): Json<StartExecutionRequest>,
) -> impl IntoResponse {
    match state
        .coordinator
        .start_execution(request.workflow_id, request.workflow, request.options, request.criteria)
        .await
    {
        Ok(execution) => (StatusCode::CREATED, Json(execution)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn list_executions(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.coordinator.list().await)
}

pub async fn get_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.get(&execution_id).await {
        Some(execution) => Json(execution).into_response(),
        None => error_response(loadmesh_core::Error::NotFound(format!("execution {execution_id}"))).into_response(),
    }
}

pub async fn pause_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.pause(&execution_id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn resume_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.resume(&execution_id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

pub async fn abort_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.abort(&execution_id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ScaleExecutionRequest {
    pub target_vus: u32,
}

pub async fn scale_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
    Json(request): Json<ScaleExecutionRequest>,
) -> impl IntoResponse {
    match state.coordinator.scale(&execution_id, request.target_vus).await {
        Ok(execution) => Json(execution).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}
