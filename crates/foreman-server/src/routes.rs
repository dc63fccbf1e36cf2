use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use foreman_agents::monitor::Monitor;
use foreman_core::types::MetricType;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn monitor(state: &AppState) -> Result<&Arc<Monitor>, StatusCode> {
    state.monitor.as_ref().ok_or(StatusCode::NOT_FOUND)
}

// ── Query / body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct WindowQuery {
    pub hours: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct MetricsQuery {
    pub metric_type: Option<String>,
    pub hours: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct AlertsQuery {
    pub hours: Option<i64>,
    pub active: Option<bool>,
}

#[derive(Deserialize)]
pub(crate) struct AckBody {
    pub acknowledged_by: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let project = state.project.lock().await;
    Json(json!({
        "uptime_s": state.start_time.elapsed().as_secs(),
        "gear": state.gear,
        "project_id": project.project_id,
        "phase": project.phase,
        "monitor": state.monitor.as_ref().map(|m| m.status()),
    }))
}

pub(crate) async fn get_project(State(state): State<Arc<AppState>>) -> Json<Value> {
    let project = state.project.lock().await.clone();
    Json(json!(project))
}

pub(crate) async fn get_messages(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.bus.message_history()))
}

pub(crate) async fn get_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let current = monitor(&state)?.get_current_health().map_err(internal)?;
    Ok(Json(json!(current)))
}

pub(crate) async fn get_health_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, StatusCode> {
    let history = monitor(&state)?
        .get_health_score_history(query.hours.unwrap_or(24), query.limit.unwrap_or(100))
        .map_err(internal)?;
    Ok(Json(json!(history)))
}

pub(crate) async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let metric_type = match query.metric_type.as_deref() {
        None => None,
        Some(name) => Some(MetricType::parse(name).ok_or(StatusCode::BAD_REQUEST)?),
    };
    let history = monitor(&state)?
        .get_metrics_history(metric_type, query.hours.unwrap_or(24), query.limit.unwrap_or(100))
        .map_err(internal)?;
    Ok(Json(json!(history)))
}

pub(crate) async fn get_metrics_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, StatusCode> {
    let summary = monitor(&state)?
        .get_metrics_summary(query.hours.unwrap_or(24))
        .map_err(internal)?;
    Ok(Json(json!(summary)))
}

pub(crate) async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let monitor = monitor(&state)?;
    let alerts = if query.active.unwrap_or(false) {
        monitor.get_active_alerts().map_err(internal)?
    } else {
        monitor.get_alert_history(query.hours.unwrap_or(24)).map_err(internal)?
    };
    Ok(Json(json!(alerts)))
}

pub(crate) async fn get_alerts_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, StatusCode> {
    let summary = monitor(&state)?
        .get_alerts_summary(query.hours.unwrap_or(24))
        .map_err(internal)?;
    Ok(Json(json!(summary)))
}

pub(crate) async fn ack_alert(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<String>,
    Json(body): Json<AckBody>,
) -> Result<Json<Value>, StatusCode> {
    let updated = monitor(&state)?
        .acknowledge_alert(&alert_id, &body.acknowledged_by)
        .map_err(internal)?;
    if !updated {
        return Err(StatusCode::CONFLICT);
    }
    Ok(Json(json!({ "acknowledged": true })))
}

pub(crate) async fn get_alert_counts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let counts = monitor(&state)?.get_alert_counts_by_severity().map_err(internal)?;
    Ok(Json(json!(counts)))
}

pub(crate) async fn get_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let ring = state.log_ring.lock().unwrap_or_else(|e| e.into_inner());
    let lines: Vec<Value> = ring
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    Json(json!(lines))
}

pub(crate) async fn stream_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.log_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|line| match line {
        Ok(line) => Some(Ok(Event::default().data(line))),
        Err(_lagged) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
