//! Jobs, events, observability, artifacts and session endpoints.

use axum::extract::{Path, Query, State};
use axum::response::sse::{KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::{FinError, FinResult};
use crate::jobs::{job_event_stream, EVENT_POLL_INTERVAL};
use crate::observability::read_structured_log_stats;
use crate::rate_limit::provider_limit;
use crate::security::encryption_enabled;
use crate::session::diff_states;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub last_event_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default = "AuditQuery::default_limit")]
    pub limit: usize,
}

impl AuditQuery {
    fn default_limit() -> usize {
        100
    }
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionSnapshotRequest {
    pub session_id: String,
    pub state: Value,
}

#[derive(Debug, Deserialize)]
pub struct SessionRehydrateRequest {
    pub session_id: String,
    #[serde(default = "SessionRehydrateRequest::default_delta_limit")]
    pub delta_limit: i64,
}

impl SessionRehydrateRequest {
    fn default_delta_limit() -> i64 {
        50
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionDiffQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextDeltaRequest {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn job_status(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
) -> FinResult<Json<Value>> {
    Ok(Json(app.state.get_job(&job_id)?))
}

pub async fn stream_job_events(
    State(app): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures_util::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>
{
    let stream = job_event_stream(app.state.clone(), query.last_event_id, EVENT_POLL_INTERVAL);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn providers_health(State(app): State<AppState>) -> FinResult<Json<Value>> {
    let mut providers = serde_json::Map::new();
    for provider in ["kite", "nse", "tradingview"] {
        let limit = provider_limit(provider)?;
        let connected = app.state.get_connector_session(provider)?.is_some();
        providers.insert(
            provider.to_string(),
            json!({
                "configured": connected,
                "connected": connected,
                "rate_limit": {
                    "max_requests": limit.max_requests,
                    "window_seconds": limit.window_seconds,
                },
            }),
        );
    }
    Ok(Json(json!({"providers": providers})))
}

pub async fn observability_metrics(State(app): State<AppState>) -> FinResult<Json<Value>> {
    let stats = read_structured_log_stats(&app.paths);
    Ok(Json(json!({
        "metrics": stats,
        "encryption_enabled": encryption_enabled(),
    })))
}

pub async fn diagnostics_readiness(State(app): State<AppState>) -> FinResult<Json<Value>> {
    let mut checks = Vec::new();
    checks.push(json!({
        "name": "runtime_paths_writable",
        "ok": app.paths.root().exists()
            && app.paths.artifacts_dir().exists()
            && app.paths.logs_dir().exists(),
        "remediation": "start the server once to initialize runtime paths",
    }));
    let state_ok = app.state.list_audit_events(Some("__readiness_probe__")).is_ok();
    checks.push(json!({
        "name": "state_store_reachable",
        "ok": state_ok,
        "remediation": "check state.sqlite permissions under the runtime root",
    }));
    let analytics_ok = app.analytics.count_table_rows("market_ohlcv").is_ok();
    checks.push(json!({
        "name": "analytics_store_reachable",
        "ok": analytics_ok,
        "remediation": "check analytics.duckdb permissions under the runtime root",
    }));
    checks.push(json!({
        "name": "encryption_key_configured",
        "ok": encryption_enabled(),
        "remediation": "set FIN_AGENT_ENCRYPTION_KEY (URL-safe base64, 32 bytes) for encrypted secret storage",
    }));

    let ready = checks
        .iter()
        .all(|check| check["ok"].as_bool().unwrap_or(false));
    Ok(Json(json!({"ready": ready, "checks": checks})))
}

pub async fn audit_events(
    State(app): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> FinResult<Json<Value>> {
    if query.limit == 0 {
        return Err(FinError::invalid("limit must be positive"));
    }
    let events = app.state.list_audit_events(query.event_type.as_deref())?;
    let start = events.len().saturating_sub(query.limit);
    let tail = &events[start..];
    Ok(Json(json!({"events": tail, "count": tail.len()})))
}

pub async fn list_artifacts(State(app): State<AppState>) -> FinResult<Json<Value>> {
    let mut files = Vec::new();
    let root = app.paths.artifacts_dir();
    let mut pending = vec![root.clone()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path.to_string_lossy().to_string());
            }
        }
    }
    files.sort();
    Ok(Json(json!({"artifacts": files})))
}

pub async fn get_artifact(
    State(app): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> FinResult<axum::response::Response> {
    use axum::response::IntoResponse;
    let requested = std::path::Path::new(&query.path);
    let resolved = requested
        .canonicalize()
        .map_err(|_| FinError::not_found(format!("artifact not found: {}", query.path)))?;
    let artifacts_root = app
        .paths
        .artifacts_dir()
        .canonicalize()
        .map_err(|e| FinError::Io(format!("artifacts dir unavailable: {}", e)))?;
    if !resolved.starts_with(&artifacts_root) {
        return Err(FinError::invalid(format!(
            "artifact path outside artifacts dir: {}",
            query.path
        )));
    }
    let bytes = std::fs::read(&resolved)?;
    Ok(bytes.into_response())
}

pub async fn session_snapshot(
    State(app): State<AppState>,
    Json(request): Json<SessionSnapshotRequest>,
) -> FinResult<Json<Value>> {
    let snapshot_id = app
        .state
        .save_session_state_snapshot(&request.session_id, &request.state)?;
    Ok(Json(json!({
        "snapshot_id": snapshot_id,
        "session_id": request.session_id,
    })))
}

pub async fn session_rehydrate(
    State(app): State<AppState>,
    Json(request): Json<SessionRehydrateRequest>,
) -> FinResult<Json<Value>> {
    let snapshot = app
        .state
        .get_latest_session_state_snapshot(&request.session_id)?;
    let deltas = app
        .state
        .list_tool_context_deltas(&request.session_id, request.delta_limit)?;
    Ok(Json(json!({
        "snapshot": snapshot,
        "deltas": deltas,
        "delta_count": deltas.len(),
    })))
}

pub async fn session_diff(
    State(app): State<AppState>,
    Query(query): Query<SessionDiffQuery>,
) -> FinResult<Json<Value>> {
    let snapshots = app.state.list_session_state_snapshots(&query.session_id, 2)?;
    if snapshots.len() < 2 {
        return Err(FinError::invalid(format!(
            "need at least two snapshots to diff session_id={}",
            query.session_id
        )));
    }
    // Rows come newest-first; diff older -> newer.
    let changes = diff_states(&snapshots[1]["state"], &snapshots[0]["state"]);
    Ok(Json(json!({
        "session_id": query.session_id,
        "from_snapshot_id": snapshots[1]["snapshot_id"],
        "to_snapshot_id": snapshots[0]["snapshot_id"],
        "changes": changes,
        "change_count": changes.len(),
    })))
}

pub async fn context_delta(
    State(app): State<AppState>,
    Json(request): Json<ContextDeltaRequest>,
) -> FinResult<Json<Value>> {
    let delta_id = app.state.append_tool_context_delta(
        &request.session_id,
        &request.tool_name,
        &request.input,
        &request.output,
    )?;
    Ok(Json(json!({
        "delta_id": delta_id,
        "session_id": request.session_id,
    })))
}
