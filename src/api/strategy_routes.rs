//! Code-strategy, backtest, tuning and live-lane endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::backtest::compare_backtest_runs;
use crate::code_strategy::backtest::{run_code_strategy_backtest, CodeBacktestRequest};
use crate::code_strategy::runner::{run_code_strategy_sandbox, SandboxLimits};
use crate::code_strategy::validator::validate_code_strategy_source;
use crate::error::{FinError, FinResult};
use crate::jobs::execute_job;
use crate::live;
use crate::preflight;
use crate::tuning::{run_and_persist_tuning, tune_strategy, SandboxCandidateRunner, TuneRequest, TuningConstraints};

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct CodeStrategyValidateRequest {
    pub source_code: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeStrategySaveRequest {
    pub strategy_name: String,
    pub source_code: String,
}

#[derive(Debug, Deserialize)]
pub struct SandboxLimitFields {
    #[serde(default = "SandboxLimitFields::default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "SandboxLimitFields::default_memory")]
    pub memory_mb: u64,
    #[serde(default = "SandboxLimitFields::default_cpu")]
    pub cpu_seconds: u64,
}

impl SandboxLimitFields {
    fn default_timeout() -> u64 {
        5
    }
    fn default_memory() -> u64 {
        512
    }
    fn default_cpu() -> u64 {
        2
    }

    fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout_seconds: self.timeout_seconds,
            memory_mb: self.memory_mb,
            cpu_seconds: self.cpu_seconds,
        }
    }
}

impl Default for SandboxLimitFields {
    fn default() -> Self {
        Self {
            timeout_seconds: Self::default_timeout(),
            memory_mb: Self::default_memory(),
            cpu_seconds: Self::default_cpu(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CodeStrategyRunRequest {
    pub source_code: String,
    #[serde(flatten)]
    pub limits: SandboxLimitFields,
    #[serde(default)]
    pub data_bundle: Option<Value>,
    #[serde(default)]
    pub frame: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CodeStrategyBacktestRequest {
    pub strategy_name: String,
    pub source_code: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    #[serde(flatten)]
    pub limits: SandboxLimitFields,
}

#[derive(Debug, Deserialize)]
pub struct BacktestCompareRequest {
    pub baseline_run_id: String,
    pub candidate_run_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TuningRunRequest {
    pub strategy_name: String,
    pub source_code: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub search_space: Value,
    #[serde(default)]
    pub objective: Option<Value>,
    #[serde(default)]
    pub max_drawdown_limit: Option<f64>,
    #[serde(default)]
    pub turnover_cap: Option<i64>,
    #[serde(default = "TuningRunRequest::default_max_trials")]
    pub max_trials: usize,
    #[serde(default = "TuningRunRequest::default_max_layers")]
    pub max_layers: usize,
    #[serde(default = "TuningRunRequest::default_keep_top")]
    pub keep_top: usize,
    #[serde(default)]
    pub max_trials_per_layer: Option<usize>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub only_plan: bool,
    #[serde(flatten)]
    pub limits: SandboxLimitFields,
}

impl TuningRunRequest {
    fn default_max_trials() -> usize {
        12
    }
    fn default_max_layers() -> usize {
        2
    }
    fn default_keep_top() -> usize {
        1
    }

    fn to_engine_request(&self, tuning_run_id: Option<String>) -> TuneRequest {
        TuneRequest {
            tuning_run_id,
            strategy_name: self.strategy_name.clone(),
            source_code: self.source_code.clone(),
            universe: self.universe.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            initial_capital: self.initial_capital,
            search_space: self.search_space.clone(),
            objective: self.objective.clone(),
            constraints: TuningConstraints {
                max_drawdown_limit: self.max_drawdown_limit,
                turnover_cap: self.turnover_cap,
            },
            max_trials: self.max_trials,
            max_layers: self.max_layers,
            keep_top: self.keep_top,
            max_trials_per_layer: self.max_trials_per_layer,
            limits: self.limits.limits(),
            context: self.context.clone(),
            random_seed: self.random_seed,
            only_plan: self.only_plan,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveActivateRequest {
    pub strategy_version_id: String,
    #[serde(default = "LiveActivateRequest::default_lookback")]
    pub lookback_days: usize,
    #[serde(flatten)]
    pub limits: SandboxLimitFields,
}

impl LiveActivateRequest {
    fn default_lookback() -> usize {
        live::DEFAULT_LOOKBACK_DAYS
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveLifecycleRequest {
    pub strategy_version_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BoundaryVisualizationRequest {
    pub strategy_version_id: String,
    #[serde(default = "BoundaryVisualizationRequest::default_top_k")]
    pub top_k: usize,
    #[serde(flatten)]
    pub limits: SandboxLimitFields,
}

impl BoundaryVisualizationRequest {
    fn default_top_k() -> usize {
        10
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub strategy_version_id: Option<String>,
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BoundaryQuery {
    pub strategy_version_id: String,
    #[serde(default = "BoundaryVisualizationRequest::default_top_k")]
    pub top_k: usize,
}

pub async fn code_strategy_validate(
    Json(request): Json<CodeStrategyValidateRequest>,
) -> FinResult<Json<Value>> {
    Ok(Json(validate_code_strategy_source(&request.source_code)?))
}

pub async fn code_strategy_save(
    State(app): State<AppState>,
    Json(request): Json<CodeStrategySaveRequest>,
) -> FinResult<Json<Value>> {
    let validation = validate_code_strategy_source(&request.source_code)?;
    let saved = app.state.save_code_strategy_version(
        &request.strategy_name,
        &request.source_code,
        &validation,
    )?;
    app.state.append_audit_event(
        "code.strategy.save",
        &json!({
            "strategy_id": saved.strategy_id,
            "strategy_version_id": saved.strategy_version_id,
            "version_number": saved.version_number,
            "strategy_name": request.strategy_name,
        }),
    )?;
    Ok(Json(json!({
        "strategy_id": saved.strategy_id,
        "strategy_version_id": saved.strategy_version_id,
        "version_number": saved.version_number,
        "validation": validation,
    })))
}

pub async fn code_strategies_list(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let strategies = app.state.list_code_strategies(query.limit)?;
    Ok(Json(json!({"strategies": strategies, "count": strategies.len()})))
}

pub async fn code_strategy_versions_list(
    State(app): State<AppState>,
    Path(strategy_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let versions = app
        .state
        .list_code_strategy_versions(&strategy_id, query.limit)?;
    Ok(Json(json!({"versions": versions, "count": versions.len()})))
}

pub async fn code_strategy_run_sandbox(
    State(app): State<AppState>,
    Json(request): Json<CodeStrategyRunRequest>,
) -> FinResult<Json<Value>> {
    let outcome = run_code_strategy_sandbox(
        &app.paths,
        &request.source_code,
        &request.limits.limits(),
        &request.data_bundle.unwrap_or_else(|| json!({})),
        &request.frame.unwrap_or_else(|| json!([])),
        &request.context.unwrap_or_else(|| json!({})),
    )
    .await?;
    Ok(Json(serde_json::to_value(outcome)?))
}

pub async fn code_strategy_backtest(
    State(app): State<AppState>,
    Json(request): Json<CodeStrategyBacktestRequest>,
) -> FinResult<Json<Value>> {
    preflight::enforce_custom_code_budget(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
        1.0,
        preflight::max_backtest_seconds()?,
    )?;
    let engine_request = CodeBacktestRequest {
        strategy_name: request.strategy_name,
        source_code: request.source_code,
        universe: request.universe,
        start_date: request.start_date,
        end_date: request.end_date,
        initial_capital: request.initial_capital,
        limits: request.limits.limits(),
    };
    let result = run_code_strategy_backtest(
        &app.paths,
        &app.analytics,
        &app.state,
        &engine_request,
        None,
    )
    .await?;
    Ok(Json(result))
}

pub async fn backtest_runs_list(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let runs = app
        .state
        .list_backtest_runs(query.strategy_version_id.as_deref(), query.limit)?;
    Ok(Json(json!({"runs": runs, "count": runs.len()})))
}

pub async fn backtest_run_detail(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> FinResult<Json<Value>> {
    Ok(Json(app.state.get_backtest_run(&run_id)?))
}

pub async fn backtest_compare(
    State(app): State<AppState>,
    Json(request): Json<BacktestCompareRequest>,
) -> FinResult<Json<Value>> {
    Ok(Json(compare_backtest_runs(
        &app.state,
        &request.baseline_run_id,
        &request.candidate_run_id,
    )?))
}

fn tuning_budget_gate(app: &AppState, request: &TuningRunRequest) -> FinResult<()> {
    if request.only_plan {
        return Ok(());
    }
    let per_trial = preflight::estimate_backtest_runtime_seconds(
        &app.analytics,
        &request.universe,
        &request.start_date,
        &request.end_date,
    )?
    .max(0.001);
    preflight::enforce_tuning_budget(
        request.max_trials as i64,
        per_trial,
        preflight::max_backtest_seconds()?,
    )?;
    Ok(())
}

pub async fn tuning_run(
    State(app): State<AppState>,
    Json(request): Json<TuningRunRequest>,
) -> FinResult<Json<Value>> {
    tuning_budget_gate(&app, &request)?;
    let engine_request = request.to_engine_request(None);
    let runner = SandboxCandidateRunner {
        paths: app.paths.clone(),
        analytics: app.analytics.clone(),
        state: app.state.clone(),
    };
    if engine_request.only_plan {
        let payload = tune_strategy(&engine_request, &runner, None).await?;
        return Ok(Json(payload));
    }
    let payload = run_and_persist_tuning(&app.state, &engine_request, &runner, None).await?;
    Ok(Json(payload))
}

pub async fn tuning_run_async(
    State(app): State<AppState>,
    Json(request): Json<TuningRunRequest>,
) -> FinResult<Json<Value>> {
    if request.only_plan {
        return Err(FinError::invalid(
            "only_plan is a synchronous request; use /v1/tuning/run",
        ));
    }
    tuning_budget_gate(&app, &request)?;

    let tuning_run_id = uuid::Uuid::new_v4().simple().to_string();
    app.state.save_tuning_run(
        &request.strategy_name,
        &json!({
            "tuning_run_id": tuning_run_id,
            "strategy_name": request.strategy_name,
            "status": "running",
        }),
    )?;
    let job_id = app.state.create_job(
        "tuning",
        &json!({
            "tuning_run_id": tuning_run_id,
            "strategy_name": request.strategy_name,
        }),
    )?;

    let engine_request = request.to_engine_request(Some(tuning_run_id.clone()));
    let state = app.state.clone();
    let runner = SandboxCandidateRunner {
        paths: app.paths.clone(),
        analytics: app.analytics.clone(),
        state: app.state.clone(),
    };
    let job_id_for_task = job_id.clone();
    let run_id_for_task = tuning_run_id.clone();
    let strategy_name = request.strategy_name.clone();

    tokio::spawn(async move {
        let work_state = state.clone();
        execute_job(state.clone(), job_id_for_task.clone(), "tuning", async move {
            let event_state = work_state.clone();
            let event_job_id = job_id_for_task.clone();
            let event_run_id = run_id_for_task.clone();
            let callback = move |event: &Value| {
                let event_type = event
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("tuning.event")
                    .to_string();
                if let Err(err) = event_state.append_job_event(&event_job_id, &event_type, event) {
                    tracing::warn!(error = %err, "failed to append tuning job event");
                }
                if let Err(err) =
                    event_state.update_tuning_run(&event_run_id, &json!({"stage": event}))
                {
                    tracing::warn!(error = %err, "failed to merge tuning progress");
                }
            };
            let payload = tune_strategy(&engine_request, &runner, Some(&callback)).await?;

            work_state.update_tuning_run(&run_id_for_task, &payload)?;
            if let Some(candidates) = payload["evaluated_candidates"].as_array() {
                for candidate in candidates {
                    work_state.append_tuning_trial(
                        &run_id_for_task,
                        candidate["run_id"].as_str().unwrap_or_default(),
                        &candidate["params"],
                        &candidate["metrics"],
                        candidate["score"].as_f64().unwrap_or(0.0),
                    )?;
                }
            }
            if let Some(layers) = payload["tuning_plan"]["layers"].as_array() {
                for layer in layers {
                    work_state.append_tuning_layer_decision(
                        &run_id_for_task,
                        layer["layer"].as_str().unwrap_or_default(),
                        layer["enabled"].as_bool().unwrap_or(false),
                        layer["reason"].as_str().unwrap_or_default(),
                        layer,
                    )?;
                }
            }
            work_state.append_audit_event(
                "tuning.run",
                &json!({
                    "tuning_run_id": run_id_for_task,
                    "strategy_name": strategy_name,
                    "trials_attempted": payload["trials_attempted"],
                    "best_run_id": payload["best_candidate"]["run_id"],
                }),
            )?;
            Ok(payload)
        })
        .await;
    });

    Ok(Json(json!({
        "job_id": job_id,
        "tuning_run_id": tuning_run_id,
        "status": "queued",
    })))
}

pub async fn tuning_runs_list(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let runs = app
        .state
        .list_tuning_runs(query.strategy_name.as_deref(), query.limit)?;
    Ok(Json(json!({"runs": runs, "count": runs.len()})))
}

pub async fn tuning_run_detail(
    State(app): State<AppState>,
    Path(tuning_run_id): Path<String>,
) -> FinResult<Json<Value>> {
    let run = app.state.get_tuning_run(&tuning_run_id)?;
    let trials = app.state.list_tuning_trials(&tuning_run_id)?;
    let layer_decisions = app.state.list_tuning_layer_decisions(&tuning_run_id)?;
    let mut detail = run;
    detail["trials"] = json!(trials);
    detail["layer_decisions"] = json!(layer_decisions);
    Ok(Json(detail))
}

pub async fn live_activate(
    State(app): State<AppState>,
    Json(request): Json<LiveActivateRequest>,
) -> FinResult<Json<Value>> {
    let runtime = live::resolve_code_strategy_runtime(&app.state, &request.strategy_version_id)?;
    let snapshot = live::build_live_snapshot(
        &app.paths,
        &app.analytics,
        &runtime.source_code,
        &runtime.universe,
        &runtime.end_date,
        request.lookback_days,
        &request.limits.limits(),
    )
    .await?;

    for row in &snapshot {
        app.state.append_live_insight(
            &runtime.strategy_version_id,
            row["action"].as_str().unwrap_or("hold"),
            row["symbol"].as_str().unwrap_or_default(),
            row["reason_code"].as_str().unwrap_or_default(),
            row["score"].as_f64().unwrap_or(0.0),
            row,
        )?;
    }
    app.state.upsert_live_state(
        &runtime.strategy_version_id,
        &runtime.strategy_name,
        "active",
        &json!({
            "last_snapshot_size": snapshot.len(),
            "universe_size": runtime.universe.len(),
            "latest_backtest_run_id": runtime.latest_run_id,
            "updated_at": chrono::Utc::now().to_rfc3339(),
        }),
    )?;
    app.state.append_audit_event(
        "live.activate",
        &json!({
            "strategy_version_id": runtime.strategy_version_id,
            "insight_count": snapshot.len(),
        }),
    )?;

    Ok(Json(json!({
        "strategy_version_id": runtime.strategy_version_id,
        "status": "active",
        "insight_count": snapshot.len(),
    })))
}

async fn live_transition(
    app: &AppState,
    strategy_version_id: &str,
    status: &str,
    stamp_key: &str,
) -> FinResult<Json<Value>> {
    let live_state = app.state.get_live_state(strategy_version_id)?;
    let mut payload = live_state["payload"].clone();
    payload[stamp_key] = json!(chrono::Utc::now().to_rfc3339());
    app.state.upsert_live_state(
        strategy_version_id,
        live_state["strategy_name"].as_str().unwrap_or_default(),
        status,
        &payload,
    )?;
    Ok(Json(json!({
        "strategy_version_id": strategy_version_id,
        "status": status,
    })))
}

pub async fn live_pause(
    State(app): State<AppState>,
    Json(request): Json<LiveLifecycleRequest>,
) -> FinResult<Json<Value>> {
    live_transition(&app, &request.strategy_version_id, "paused", "paused_at").await
}

pub async fn live_stop(
    State(app): State<AppState>,
    Json(request): Json<LiveLifecycleRequest>,
) -> FinResult<Json<Value>> {
    live_transition(&app, &request.strategy_version_id, "stopped", "stopped_at").await
}

pub async fn live_states_list(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let states = app
        .state
        .list_live_states(query.status.as_deref(), query.limit)?;
    Ok(Json(json!({"states": states, "count": states.len()})))
}

pub async fn live_state_detail(
    State(app): State<AppState>,
    Path(strategy_version_id): Path<String>,
) -> FinResult<Json<Value>> {
    Ok(Json(app.state.get_live_state(&strategy_version_id)?))
}

pub async fn live_feed(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> FinResult<Json<Value>> {
    let insights = app
        .state
        .list_live_insights(query.strategy_version_id.as_deref(), query.limit)?;
    Ok(Json(json!({"insights": insights, "count": insights.len()})))
}

pub async fn live_boundary_candidates(
    State(app): State<AppState>,
    Query(query): Query<BoundaryQuery>,
) -> FinResult<Json<Value>> {
    let runtime = live::resolve_code_strategy_runtime(&app.state, &query.strategy_version_id)?;
    let snapshot = live::build_live_snapshot(
        &app.paths,
        &app.analytics,
        &runtime.source_code,
        &runtime.universe,
        &runtime.end_date,
        live::DEFAULT_LOOKBACK_DAYS,
        &SandboxLimits::default(),
    )
    .await?;
    let candidates = live::boundary_candidates(&snapshot, query.top_k)?;
    Ok(Json(json!({
        "strategy_version_id": runtime.strategy_version_id,
        "candidates": candidates,
        "count": candidates.len(),
        "similarity_method": "distance_to_signal_decision_boundary",
    })))
}

pub async fn visualize_boundary(
    State(app): State<AppState>,
    Json(request): Json<BoundaryVisualizationRequest>,
) -> FinResult<Json<Value>> {
    let runtime = live::resolve_code_strategy_runtime(&app.state, &request.strategy_version_id)?;
    let snapshot = live::build_live_snapshot(
        &app.paths,
        &app.analytics,
        &runtime.source_code,
        &runtime.universe,
        &runtime.end_date,
        live::DEFAULT_LOOKBACK_DAYS,
        &request.limits.limits(),
    )
    .await?;
    let candidates = live::boundary_candidates(&snapshot, request.top_k)?;
    let chart_path =
        live::write_boundary_chart(&app.paths, &runtime.strategy_version_id, &candidates)?;
    Ok(Json(json!({
        "strategy_version_id": runtime.strategy_version_id,
        "boundary_chart_path": chart_path,
        "candidates": candidates,
        "similarity_method": "distance_to_signal_decision_boundary",
    })))
}
