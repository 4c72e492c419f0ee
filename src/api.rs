use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::alerts::{AlertHub, MonitorAlert};
use crate::emergency::{
    EmergencyPriority, EmergencyReason, EmergencyStatistics, EmergencySyncRequest, EmergencySyncResult,
    EmergencyTrigger,
};
use crate::health::{HealthMonitor, HealthStatus, SystemHealthReport};
use crate::model::{SyncError, SyncStatus};
use crate::orchestrator::{OrchestratorStatus, SyncOrchestrator};
use crate::scheduler::{JobHistoryEntry, SchedulerStatistics, SchedulerStatus, SyncScheduler};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: Arc<SyncScheduler>,
    pub emergency: Arc<EmergencyTrigger>,
    pub health: Arc<HealthMonitor>,
    pub alerts: Arc<AlertHub>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/alerts", get(alerts))
        .route("/alerts/{id}/ack", post(ack_alert))
        .route("/sync", post(manual_sync))
        .route("/emergency", post(emergency))
        .route("/emergency/active", get(emergency_active))
        .route("/emergency/statistics", get(emergency_statistics))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// `anyhow` errors mapped onto HTTP; hard faults from [`SyncError`] keep their meaning.
struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self.0.downcast_ref::<SyncError>() {
            Some(SyncError::UnknownSource(_)) => StatusCode::NOT_FOUND,
            Some(SyncError::AlreadyRunning) => StatusCode::CONFLICT,
            Some(SyncError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if code == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "api", "request failed: {:#}", self.0);
        }
        (code, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health(State(state): State<AppState>) -> Result<(StatusCode, Json<SystemHealthReport>), ApiError> {
    let report = state.health.perform_health_check().await?;
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy | HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((code, Json(report)))
}

#[derive(serde::Serialize)]
struct StatusOut {
    scheduler: SchedulerStatus,
    orchestrator: OrchestratorStatus,
    sources: Vec<SyncStatus>,
    statistics: SchedulerStatistics,
}

async fn status(State(state): State<AppState>) -> ApiResult<StatusOut> {
    let sources = state.orchestrator.monitor().store().list().await?;
    Ok(Json(StatusOut {
        scheduler: state.scheduler.get_status(),
        orchestrator: state.orchestrator.get_status(),
        sources,
        statistics: state.scheduler.get_statistics(),
    }))
}

#[derive(serde::Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn history(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Json<Vec<JobHistoryEntry>> {
    let mut rows = state.scheduler.get_history();
    rows.reverse();
    rows.truncate(q.limit.unwrap_or(20));
    Json(rows)
}

#[derive(serde::Deserialize)]
struct AlertQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    unacknowledged: bool,
}

async fn alerts(State(state): State<AppState>, Query(q): Query<AlertQuery>) -> Json<Vec<MonitorAlert>> {
    let limit = q.limit.unwrap_or(50);
    let mut rows = if q.unacknowledged {
        state.alerts.unacknowledged()
    } else {
        state.alerts.recent(limit)
    };
    rows.truncate(limit);
    Json(rows)
}

async fn ack_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.alerts.acknowledge(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn manual_sync(State(state): State<AppState>) -> ApiResult<JobHistoryEntry> {
    Ok(Json(state.scheduler.trigger_manual().await?))
}

#[derive(serde::Deserialize)]
struct EmergencyReq {
    #[serde(default)]
    sources: Vec<String>,
    reason: EmergencyReason,
    #[serde(default = "default_priority")]
    priority: EmergencyPriority,
    requested_by: String,
    #[serde(default)]
    notes: Option<String>,
}

fn default_priority() -> EmergencyPriority {
    EmergencyPriority::High
}

async fn emergency(State(state): State<AppState>, Json(body): Json<EmergencyReq>) -> ApiResult<EmergencySyncResult> {
    let result = state
        .emergency
        .trigger(&body.sources, body.reason, body.priority, &body.requested_by, body.notes)
        .await?;
    Ok(Json(result))
}

async fn emergency_statistics(State(state): State<AppState>) -> Json<EmergencyStatistics> {
    Json(state.emergency.get_statistics())
}

async fn emergency_active(State(state): State<AppState>) -> Json<Vec<EmergencySyncRequest>> {
    Json(state.emergency.get_active_requests())
}
