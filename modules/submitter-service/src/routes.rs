//! Axum route handlers for the operator RPC API.

use crate::db::Db;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;
use std::time::Instant;
use submitter_core::{AdmissionError, Dispatcher, SettingsGate, SettingsService};
use submitter_types::*;

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 500;

pub struct AppState {
    pub settings: Arc<SettingsService>,
    pub dispatcher: Arc<Dispatcher>,
    pub db: Arc<Db>,
    pub start_time: Instant,
}

// GET /rpc/settings
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Settings>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.settings.get())))
}

// POST /rpc/settings
pub async fn set_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> (StatusCode, Json<RpcResponse<Settings>>) {
    match state.settings.apply(&update) {
        Ok(s) => (StatusCode::OK, Json(RpcResponse::ok(s))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(e.to_string())),
        ),
    }
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let dispatcher = &state.dispatcher;
    let config = dispatcher.config();
    let queue = dispatcher.queue();
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            running: dispatcher.is_running(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            admin_address: config.admin_address.clone(),
            maintenance_mode: state.settings.is_maintenance_mode(),
            worker_count: config.worker_count,
            queue_length: queue.len(),
            queue_outstanding: queue.outstanding(),
            queue_capacity: queue.capacity(),
            in_flight: dispatcher.in_flight(),
            keys: dispatcher.keys().stats(),
            key_states: dispatcher.keys().snapshot(),
        })),
    )
}

// POST /rpc/jobs/submit
pub async fn job_submit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JobPayload>,
) -> (StatusCode, Json<RpcResponse<JobSummary>>) {
    match state.dispatcher.submit(payload) {
        Ok(job) => (StatusCode::OK, Json(RpcResponse::ok(job))),
        Err(e) => {
            let code = match e {
                AdmissionError::AtCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
                AdmissionError::MaintenanceMode | AdmissionError::Closed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            (code, Json(RpcResponse::err(e.to_string())))
        }
    }
}

// POST /rpc/jobs/get
pub async fn job_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetJobRequest>,
) -> (StatusCode, Json<RpcResponse<Option<JobSummary>>>) {
    // live state first; the outbox also knows jobs from earlier runs
    if let Some(job) = state.dispatcher.job(&req.id) {
        return (StatusCode::OK, Json(RpcResponse::ok(Some(job))));
    }
    match state.db.get_job(&req.id) {
        Ok(job) => (StatusCode::OK, Json(RpcResponse::ok(job))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(RpcResponse::err(e))),
    }
}

// GET /rpc/jobs/recent?status=failed&limit=20
pub async fn jobs_recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentJobsQuery>,
) -> (StatusCode, Json<RpcResponse<Vec<JobSummary>>>) {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    match state.db.list_recent_jobs(query.status, limit) {
        Ok(jobs) => (StatusCode::OK, Json(RpcResponse::ok(jobs))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(RpcResponse::err(e))),
    }
}
