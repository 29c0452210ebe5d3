//! Data ingest, world-state, preflight and screener endpoints.

use std::path::PathBuf;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::data;
use crate::error::FinResult;
use crate::preflight;
use crate::screener;
use crate::world_state;

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FundamentalsAsOfRequest {
    pub symbol: String,
    pub as_of: String,
}

#[derive(Debug, Deserialize)]
pub struct WorldBuildRequest {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "WorldBuildRequest::default_policy")]
    pub adjustment_policy: String,
}

impl WorldBuildRequest {
    fn default_policy() -> String {
        "none".to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct WorldValidationRequest {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub strict_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct TechnicalsRequest {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub short_window: i64,
    pub long_window: i64,
}

#[derive(Debug, Deserialize)]
pub struct PreflightTuningRequest {
    pub num_trials: i64,
    pub per_trial_estimated_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct PreflightCustomCodeRequest {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "PreflightCustomCodeRequest::default_multiplier")]
    pub complexity_multiplier: f64,
}

impl PreflightCustomCodeRequest {
    fn default_multiplier() -> f64 {
        1.0
    }
}

#[derive(Debug, Deserialize)]
pub struct ScreenerFormulaValidateRequest {
    pub formula: String,
}

#[derive(Debug, Deserialize)]
pub struct ScreenerRunRequest {
    pub formula: String,
    pub as_of: String,
    pub universe: Vec<String>,
    #[serde(default = "default_limit")]
    pub top_k: i64,
    #[serde(default)]
    pub rank_by: Option<String>,
    #[serde(default = "ScreenerRunRequest::default_sort_order")]
    pub sort_order: String,
}

impl ScreenerRunRequest {
    fn default_sort_order() -> String {
        "desc".to_string()
    }
}

pub async fn import_ohlcv(
    State(app): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> FinResult<Json<Value>> {
    let result =
        data::import_ohlcv_file(&app.analytics, &app.state, &PathBuf::from(&request.path))?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn import_fundamentals(
    State(app): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> FinResult<Json<Value>> {
    let result =
        data::import_fundamentals_file(&app.analytics, &app.state, &PathBuf::from(&request.path))?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn import_corporate_actions(
    State(app): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> FinResult<Json<Value>> {
    let result = data::import_corporate_actions_file(
        &app.analytics,
        &app.state,
        &PathBuf::from(&request.path),
    )?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn import_ratings(
    State(app): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> FinResult<Json<Value>> {
    let result =
        data::import_ratings_file(&app.analytics, &app.state, &PathBuf::from(&request.path))?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn fundamentals_as_of(
    State(app): State<AppState>,
    Json(request): Json<FundamentalsAsOfRequest>,
) -> FinResult<Json<Value>> {
    let row = data::query_fundamentals_as_of(&app.analytics, &request.symbol, &request.as_of)?;
    Ok(Json(row))
}

pub async fn technicals_compute(
    State(app): State<AppState>,
    Json(request): Json<TechnicalsRequest>,
) -> FinResult<Json<Value>> {
    let inserted = data::compute_sma_features(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        request.short_window,
        request.long_window,
    )?;
    Ok(Json(json!({"rows_inserted": inserted})))
}

pub async fn universe_resolve(
    State(app): State<AppState>,
    Json(symbols): Json<Vec<String>>,
) -> FinResult<Json<Value>> {
    let resolved = data::resolve_universe(&app.analytics, &symbols)?;
    Ok(Json(json!({"universe": resolved, "count": resolved.len()})))
}

pub async fn world_state_build(
    State(app): State<AppState>,
    Json(request): Json<WorldBuildRequest>,
) -> FinResult<Json<Value>> {
    let budget = preflight::enforce_world_state_budget(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        preflight::max_world_state_seconds()?,
    )?;
    let manifest = world_state::build_world_state_manifest(
        &app.analytics,
        &app.state,
        &request.universe,
        &request.start_date,
        &request.end_date,
        &request.adjustment_policy,
    )?;
    app.state.append_audit_event(
        "world_state.build",
        &json!({
            "manifest_id": manifest.manifest_id,
            "row_count": manifest.row_count,
            "data_hash": manifest.data_hash,
            "estimated_seconds": budget.estimated_seconds,
        }),
    )?;
    Ok(Json(serde_json::to_value(manifest)?))
}

pub async fn world_state_completeness(
    State(app): State<AppState>,
    Json(request): Json<WorldValidationRequest>,
) -> FinResult<Json<Value>> {
    let report = world_state::build_data_completeness_report(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        request.strict_mode,
    )?;
    Ok(Json(serde_json::to_value(report)?))
}

pub async fn world_state_validate_pit(
    State(app): State<AppState>,
    Json(request): Json<WorldValidationRequest>,
) -> FinResult<Json<Value>> {
    let report = world_state::validate_world_state_pit(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        request.strict_mode,
    )?;
    Ok(Json(serde_json::to_value(report)?))
}

pub async fn preflight_world_state(
    State(app): State<AppState>,
    Json(request): Json<WorldBuildRequest>,
) -> FinResult<Json<Value>> {
    let check = preflight::enforce_world_state_budget(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        preflight::max_world_state_seconds()?,
    )?;
    Ok(Json(serde_json::to_value(check)?))
}

pub async fn preflight_backtest(
    State(app): State<AppState>,
    Json(request): Json<WorldBuildRequest>,
) -> FinResult<Json<Value>> {
    let check = preflight::enforce_backtest_budget(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        preflight::max_backtest_seconds()?,
    )?;
    Ok(Json(serde_json::to_value(check)?))
}

pub async fn preflight_tuning(
    Json(request): Json<PreflightTuningRequest>,
) -> FinResult<Json<Value>> {
    let check = preflight::enforce_tuning_budget(
        request.num_trials,
        request.per_trial_estimated_seconds,
        preflight::max_backtest_seconds()?,
    )?;
    Ok(Json(serde_json::to_value(check)?))
}

pub async fn preflight_custom_code(
    State(app): State<AppState>,
    Json(request): Json<PreflightCustomCodeRequest>,
) -> FinResult<Json<Value>> {
    let check = preflight::enforce_custom_code_budget(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        request.complexity_multiplier,
        preflight::max_backtest_seconds()?,
    )?;
    Ok(Json(serde_json::to_value(check)?))
}

pub async fn screener_formula_validate(
    Json(request): Json<ScreenerFormulaValidateRequest>,
) -> FinResult<Json<Value>> {
    let compiled = screener::validate_formula(&request.formula)?;
    Ok(Json(serde_json::to_value(compiled)?))
}

pub async fn screener_run(
    State(app): State<AppState>,
    Json(request): Json<ScreenerRunRequest>,
) -> FinResult<Json<Value>> {
    let result = screener::run_formula_screen(
        &app.analytics,
        &request.formula,
        &request.as_of,
        &request.universe,
        request.top_k,
        request.rank_by.as_deref(),
        &request.sort_order,
    )?;
    Ok(Json(result))
}
