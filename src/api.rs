//! Administrative routes over the audit trail.
//!
//! - `GET /api/audit-logs` filtered, paginated search
//! - `GET /api/audit-logs/{request_id}` single call lookup
//! - `GET /health/audit-search` backend health report

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::health::{HealthProbe, HealthStatus};
use crate::index::IndexWriter;
use crate::query::AuditLogFilter;
use crate::record::LogRecord;

#[derive(Clone)]
pub struct AuditApiState {
    pub writer: IndexWriter,
    pub probe: HealthProbe,
}

/// Search response envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogPage {
    pub items: Vec<LogRecord>,
    pub total_count: u64,
}

pub fn router(state: AuditApiState) -> Router {
    Router::new()
        .route("/api/audit-logs", get(search_logs))
        .route("/api/audit-logs/{request_id}", get(get_log))
        .route("/health/audit-search", get(health))
        .with_state(state)
}

async fn search_logs(
    State(state): State<AuditApiState>,
    Query(filter): Query<AuditLogFilter>,
) -> Json<AuditLogPage> {
    let hits = state.writer.search(&filter).await;
    Json(AuditLogPage {
        items: hits.records,
        total_count: hits.total,
    })
}

async fn get_log(State(state): State<AuditApiState>, Path(request_id): Path<String>) -> Response {
    match state.writer.find_by_request_id(&request_id).await {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn health(State(state): State<AuditApiState>) -> Response {
    let report = state.probe.check().await;
    // Degraded still answers 200 so readiness gating ignores this tier.
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}
