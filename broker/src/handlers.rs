use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use common::{
    new_job_id, AnalysisWorkerTask, CapacityRequest, JobSummary, RegionalJobRequest,
    SinglePointRequest, SinglePointResponse, UnreachableWorkerReport, WorkerStatus,
};

use crate::broker::CapacityOutcome;
use crate::error::BrokerError;
use crate::state::AppState;

/// Segundos que se le pide esperar al cliente mientras arranca un worker.
const SINGLE_POINT_RETRY_AFTER_SECS: u64 = 30;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/internal/poll", post(poll))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/jobs/:id/partial", get(partial_result))
        .route("/api/workers", get(list_workers))
        .route("/api/capacity", post(request_capacity))
        .route("/api/single", post(single_point))
        .route("/api/single/unreachable", post(single_point_unreachable))
        .route("/api/results/:id", get(get_result))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Corre trabajo bloqueante del broker (locks, disco) fuera del runtime async.
async fn blocking<F, T>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Internal(e.to_string()))
}

/* ---------------- handlers HTTP ---------------- */

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "started_at": state.started_at }))
}

// Poll de un worker: primero sus resultados, después su observación y por último tareas nuevas
async fn poll(
    State(state): State<AppState>,
    Json(status): Json<WorkerStatus>,
) -> Result<Response, BrokerError> {
    let broker = state.broker.clone();
    let tasks = blocking(move || {
        for result in &status.results {
            let outcome = broker.report_result(result);
            debug!(
                "resultado {} / {} de {}: {:?}",
                result.job_id, result.task_id, status.worker_id, outcome
            );
        }
        broker.record_worker(&status);
        broker.poll_for_work(&status.category)
    })
    .await?;

    if tasks.is_empty() {
        return Ok((StatusCode::NO_CONTENT, Json(Vec::<AnalysisWorkerTask>::new())).into_response());
    }
    let tasks: Vec<AnalysisWorkerTask> = tasks
        .into_iter()
        .map(AnalysisWorkerTask::RegionalAnalysis)
        .collect();
    Ok(Json(tasks).into_response())
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<RegionalJobRequest>,
) -> Result<(StatusCode, Json<JobSummary>), BrokerError> {
    let (template, tags) = req.into_template(new_job_id());
    let broker = state.broker.clone();
    let summary = blocking(move || broker.enqueue_job(template, tags)).await??;
    info!("job {} creado con {} tareas", summary.job_id, summary.n_tasks_total);
    Ok((StatusCode::CREATED, Json(summary)))
}

// Un resumen por job y al final la fila con la suma
async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    let mut summaries = state.broker.job_summaries();
    let total = JobSummary::aggregate(&summaries);
    summaries.push(total);
    Json(summaries)
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, BrokerError> {
    match state.broker.job_status(&job_id) {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(BrokerError::UnknownJob(job_id)),
    }
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, BrokerError> {
    let broker = state.broker.clone();
    let id = job_id.clone();
    if blocking(move || broker.delete_job(&id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BrokerError::UnknownJob(job_id))
    }
}

// Resultado parcial: el archivo puede seguir creciendo mientras el job corre
async fn partial_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, BrokerError> {
    let path = state
        .broker
        .partial_buffer(&job_id)
        .ok_or_else(|| BrokerError::UnknownJob(job_id.clone()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| BrokerError::Internal(format!("{}: {}", path.display(), e)))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], Body::from(bytes)).into_response())
}

async fn list_workers(State(state): State<AppState>) -> Response {
    Json(state.broker.worker_observations()).into_response()
}

async fn request_capacity(
    State(state): State<AppState>,
    Json(req): Json<CapacityRequest>,
) -> Result<(StatusCode, Json<CapacityOutcome>), BrokerError> {
    let outcome = state
        .broker
        .request_capacity(&req.category, &req.tags, req.n_on_demand, req.n_spot)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

// Dirección de un worker con la red cargada; si no hay, se pide uno y el cliente reintenta
async fn single_point(
    State(state): State<AppState>,
    Json(req): Json<SinglePointRequest>,
) -> Result<Response, BrokerError> {
    let category = req.task.category();
    if let Some(address) = state.broker.single_point_address(&category) {
        let url = format!("http://{}:{}/single", address, state.broker.config().launch.worker_port);
        return Ok(Json(SinglePointResponse { address, url }).into_response());
    }

    info!("no hay workers para {}, pidiendo uno para single-point", category);
    state.broker.request_capacity(&category, &req.tags, 1, 0)?;
    let body = json!({
        "message": format!("arrancando un worker para {}, reintentar en {} s", category, SINGLE_POINT_RETRY_AFTER_SECS)
    });
    Ok((
        StatusCode::ACCEPTED,
        [(header::RETRY_AFTER, SINGLE_POINT_RETRY_AFTER_SECS.to_string())],
        Json(body),
    )
        .into_response())
}

async fn single_point_unreachable(
    State(state): State<AppState>,
    Json(report): Json<UnreachableWorkerReport>,
) -> Json<serde_json::Value> {
    warn!("worker single-point de {} inalcanzable", report.category);
    let preferred = state.broker.reassign_preferred(&report.category);
    Json(json!({ "preferred": preferred }))
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    percentile: Option<u32>,
    cutoff: Option<u32>,
}

async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Response, BrokerError> {
    let selector = match (query.percentile, query.cutoff) {
        (Some(p), Some(c)) => Some((p, c)),
        (None, None) => None,
        _ => {
            return Err(BrokerError::InvalidRequest(
                "percentile y cutoff van juntos".to_string(),
            ))
        }
    };
    let broker = state.broker.clone();
    let bytes = blocking(move || broker.stored_result(&job_id, selector)).await??;
    Ok(([(header::CONTENT_TYPE, "application/gzip")], Body::from(bytes)).into_response())
}
