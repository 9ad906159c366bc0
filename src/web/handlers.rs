//! HTTP request handlers.

use super::AppState;
use crate::db::{
    AlertFilter, AlertState, DbError, ManualOverride, MonitorFilter, MonitorKind, MonitorSpec,
    Observation, Origin, Persistence, Schedule, Status,
};
use crate::scheduler::floor_minute;
use crate::uptime::{check_window, UptimeError};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;

/// Webhook observations older than this are rejected.
pub const MAX_WEBHOOK_AGE_DAYS: i64 = 90;

// ============================================================================
// Errors
// ============================================================================

/// Rejections returned to API callers before anything is written.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unknown monitor: {0}")]
    UnknownMonitor(String),
    #[error("monitor {0} is inactive")]
    InactiveMonitor(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("latency must be a non-negative number")]
    InvalidLatency,
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("timestamp is in the future")]
    FutureTimestamp,
    #[error("timestamp is older than 90 days")]
    StaleTimestamp,
    #[error("heartbeat secret does not match")]
    BadSecret,
    #[error("malformed request: {0}")]
    InvalidBody(String),
    #[error("{0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::UnknownMonitor(_) => "unknown_monitor",
            IngestError::InactiveMonitor(_) => "inactive_monitor",
            IngestError::InvalidStatus(_) => "invalid_status",
            IngestError::InvalidLatency => "invalid_latency",
            IngestError::InvalidTimestamp(_) => "invalid_timestamp",
            IngestError::FutureTimestamp => "future_timestamp",
            IngestError::StaleTimestamp => "stale_timestamp",
            IngestError::BadSecret => "bad_secret",
            IngestError::InvalidBody(_) => "invalid_body",
            IngestError::Invalid(_) => "invalid_request",
            IngestError::Storage(_) => "storage_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            IngestError::BadSecret => StatusCode::UNAUTHORIZED,
            IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        if let IngestError::Storage(e) = &self {
            tracing::error!("request failed: {}", e);
        }
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for IngestError {
    fn from(rejection: JsonRejection) -> Self {
        IngestError::InvalidBody(rejection.body_text())
    }
}

impl From<QueryRejection> for IngestError {
    fn from(rejection: QueryRejection) -> Self {
        IngestError::InvalidBody(rejection.body_text())
    }
}

impl From<UptimeError> for IngestError {
    fn from(e: UptimeError) -> Self {
        match e {
            UptimeError::Storage(db) => IngestError::Storage(db),
            other => IngestError::Invalid(other.to_string()),
        }
    }
}

fn not_found(what: &str) -> Response {
    let body = json!({ "error": { "code": "not_found", "message": format!("{} not found", what) } });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

/// Accepts RFC 3339 or integer epoch seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| IngestError::InvalidTimestamp(raw.to_string()));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| IngestError::InvalidTimestamp(raw.to_string()))
}

// ============================================================================
// Webhook ingestion
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub tag: String,
    pub status: String,
    pub latency: f64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Validate a webhook payload and build the observation it would write.
pub fn validate_webhook(
    store: &dyn Persistence,
    req: &WebhookRequest,
    now: DateTime<Utc>,
) -> Result<Observation, IngestError> {
    let monitor = store
        .get_monitor(&req.tag)?
        .ok_or_else(|| IngestError::UnknownMonitor(req.tag.clone()))?;
    if !monitor.active {
        return Err(IngestError::InactiveMonitor(req.tag.clone()));
    }

    let status = match Status::from_str(&req.status) {
        Ok(Status::NoData) | Err(_) => return Err(IngestError::InvalidStatus(req.status.clone())),
        Ok(s) => s,
    };
    if !req.latency.is_finite() || req.latency < 0.0 {
        return Err(IngestError::InvalidLatency);
    }

    let timestamp = match &req.timestamp {
        Some(raw) => parse_timestamp(raw)?,
        None => now,
    };
    if timestamp > now {
        return Err(IngestError::FutureTimestamp);
    }
    if timestamp < now - ChronoDuration::days(MAX_WEBHOOK_AGE_DAYS) {
        return Err(IngestError::StaleTimestamp);
    }

    Ok(Observation {
        monitor_tag: monitor.tag,
        timestamp: floor_minute(timestamp),
        status,
        latency: req.latency,
        origin: Origin::Webhook,
    })
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookRequest>, JsonRejection>,
) -> Result<Json<AcceptedResponse>, IngestError> {
    let Json(req) = payload?;
    let obs = validate_webhook(state.store.as_ref(), &req, Utc::now())?;
    state.store.insert_observation(&obs)?;
    state.executor.observation_written(&obs);

    tracing::debug!(monitor = %obs.monitor_tag, status = %obs.status, "webhook observation accepted");
    Ok(Json(AcceptedResponse {
        status: "accepted",
        timestamp: obs.timestamp,
    }))
}

// ============================================================================
// Heartbeats
// ============================================================================

pub async fn handle_heartbeat(
    State(state): State<AppState>,
    Path((tag, secret)): Path<(String, String)>,
) -> Response {
    let monitor = match state.store.get_monitor(&tag) {
        Ok(Some(m)) if m.active => m,
        Ok(_) => return not_found("heartbeat monitor"),
        Err(e) => return IngestError::from(e).into_response(),
    };
    let MonitorSpec::Heartbeat(settings) = &monitor.spec else {
        return not_found("heartbeat monitor");
    };
    if settings.secret != secret {
        tracing::warn!(monitor = %tag, "heartbeat with wrong secret");
        return IngestError::BadSecret.into_response();
    }

    let obs = Observation {
        monitor_tag: monitor.tag.clone(),
        timestamp: floor_minute(Utc::now()),
        status: Status::Up,
        latency: 0.0,
        origin: Origin::Signal,
    };
    if let Err(e) = state.store.insert_observation(&obs) {
        return IngestError::from(e).into_response();
    }
    state.executor.observation_written(&obs);

    Json(AcceptedResponse {
        status: "accepted",
        timestamp: obs.timestamp,
    })
    .into_response()
}

// ============================================================================
// Monitors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitorSummary {
    pub tag: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MonitorKind,
    pub active: bool,
    pub schedule: Schedule,
    pub latest: Option<Observation>,
}

pub async fn handle_get_monitors(State(state): State<AppState>) -> Result<Json<Vec<MonitorSummary>>, IngestError> {
    let monitors = state.store.get_monitors(&MonitorFilter::default())?;

    let mut summaries = Vec::with_capacity(monitors.len());
    for m in monitors {
        let latest = state.store.get_latest_observation(&m.tag)?;
        summaries.push(MonitorSummary {
            name: m.display_name().to_string(),
            kind: m.kind(),
            active: m.active,
            schedule: m.schedule,
            tag: m.tag,
            latest,
        });
    }
    Ok(Json(summaries))
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub monitor_tag: Option<String>,
    pub state: Option<String>,
}

pub async fn handle_get_alerts(
    State(state): State<AppState>,
    query: Result<Query<AlertsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, IngestError> {
    let Query(query) = query?;
    let alert_state = query
        .state
        .as_deref()
        .map(AlertState::from_str)
        .transpose()
        .map_err(IngestError::Invalid)?;

    let alerts = state.store.get_alerts(&AlertFilter {
        monitor_tag: query.monitor_tag,
        status_class: None,
        state: alert_state,
    })?;
    Ok(Json(alerts))
}

// ============================================================================
// Manual overrides
// ============================================================================

pub async fn handle_create_override(
    State(state): State<AppState>,
    payload: Result<Json<ManualOverride>, JsonRejection>,
) -> Result<impl IntoResponse, IngestError> {
    let Json(mut req) = payload?;
    if state.store.get_monitor(&req.monitor_tag)?.is_none() {
        return Err(IngestError::UnknownMonitor(req.monitor_tag));
    }
    if req.status == Status::NoData {
        return Err(IngestError::InvalidStatus(req.status.to_string()));
    }
    if matches!(req.end, Some(end) if end <= req.start) {
        return Err(IngestError::Invalid("end must be after start".to_string()));
    }

    req.id = state.store.insert_override(&req)?;
    tracing::info!(monitor = %req.monitor_tag, status = %req.status, "manual override registered");
    Ok((StatusCode::CREATED, Json(req)))
}

// ============================================================================
// Uptime
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    /// Comma separated monitor tags.
    pub tags: String,
    pub start: Option<String>,
    /// Bucket width in seconds (default: one day).
    pub interval: Option<i64>,
    /// Number of buckets (default: 1).
    pub count: Option<i64>,
}

pub async fn handle_get_uptime(
    State(state): State<AppState>,
    query: Result<Query<UptimeQuery>, QueryRejection>,
) -> Result<impl IntoResponse, IngestError> {
    let Query(query) = query?;
    let tags: Vec<String> = query
        .tags
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let interval = query.interval.unwrap_or(86_400);
    let count = usize::try_from(query.count.unwrap_or(1))
        .map_err(|_| IngestError::Invalid("count must be positive".to_string()))?;
    check_window(interval, count)?;

    let start = match &query.start {
        Some(raw) => parse_timestamp(raw)?,
        None => {
            let from = interval
                .checked_mul(count as i64)
                .and_then(ChronoDuration::try_seconds)
                .and_then(|span| Utc::now().checked_sub_signed(span))
                .ok_or_else(|| IngestError::Invalid("window is out of range".to_string()))?;
            floor_minute(from)
        }
    };

    let summary = state.uptime.summarize(&tags, start, interval, count)?;
    Ok(Json(summary))
}
