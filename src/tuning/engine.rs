//! Bounded layered tuning engine.
//!
//! Deterministic exploration of a user-declared search space: per-layer
//! candidate grids (choice lists, stepped grids, min/mid/max probes, anchor
//! refinement), a deterministic seeded shuffle, dedupe across layers, domain
//! and metric constraints, objective scoring and post-hoc sensitivity
//! analysis. Never delegates to an external optimizer.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::code_strategy::runner::SandboxLimits;
use crate::error::{FinError, FinResult};
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TuningConstraints {
    pub max_drawdown_limit: Option<f64>,
    pub turnover_cap: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TuneRequest {
    pub tuning_run_id: Option<String>,
    pub strategy_name: String,
    pub source_code: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub search_space: Value,
    pub objective: Option<Value>,
    pub constraints: TuningConstraints,
    pub max_trials: usize,
    pub max_layers: usize,
    pub keep_top: usize,
    pub max_trials_per_layer: Option<usize>,
    pub limits: SandboxLimits,
    pub context: Option<Value>,
    pub random_seed: Option<u64>,
    pub only_plan: bool,
}

/// Executes one parameter combination and returns the backtest payload
/// (must include `run_id` and `metrics`). The sandbox-backed implementation
/// lives next to the API layer; tests substitute a stub.
#[async_trait]
pub trait CandidateRunner: Send + Sync {
    async fn run(&self, request: &TuneRequest, params: &Value, seed: i64) -> FinResult<Value>;
}

/// Progress events (`tuning.plan.ready`, `tuning.layer.*`,
/// `tuning.candidate.*`) for the async job pathway.
pub type EventCallback<'a> = &'a (dyn Fn(&Value) + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
enum ParamKind {
    Choice,
    IntRange,
    FloatRange,
}

#[derive(Debug, Clone)]
struct ParameterSpec {
    name: String,
    kind: ParamKind,
    min_value: f64,
    max_value: f64,
    values: Vec<Value>,
    step: Option<f64>,
}

#[derive(Debug, Clone)]
struct Objective {
    metric: String,
    maximize: bool,
    weights: BTreeMap<String, f64>,
}

/// Sign convention per metric: cost-like metrics score inverted.
fn metric_direction(metric_name: &str) -> f64 {
    let lowered = metric_name.to_lowercase();
    if lowered.contains("drawdown") || lowered.contains("stdev") || lowered.contains("volatility") {
        -1.0
    } else {
        1.0
    }
}

fn coerce_f64(value: &Value, label: &str) -> FinResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| FinError::invalid(format!("{} must be numeric: {}", label, value)))
}

fn parse_objective(payload: Option<&Value>) -> FinResult<Objective> {
    let Some(payload) = payload else {
        return Ok(Objective {
            metric: "sharpe".to_string(),
            maximize: true,
            weights: BTreeMap::from([("sharpe".to_string(), 1.0)]),
        });
    };
    let metric = payload
        .get("metric")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "sharpe".to_string());
    if metric.is_empty() {
        return Err(FinError::invalid("objective.metric is required"));
    }
    let maximize = payload
        .get("maximize")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let weights = match payload.get("weights") {
        None | Some(Value::Null) => {
            BTreeMap::from([(metric.clone(), if maximize { 1.0 } else { -1.0 })])
        }
        Some(raw) => {
            let map = raw
                .as_object()
                .ok_or_else(|| FinError::invalid("objective.weights must be an object when provided"))?;
            if map.is_empty() {
                return Err(FinError::invalid("objective.weights must not be empty"));
            }
            let mut weights = BTreeMap::new();
            for (key, value) in map {
                let name = key.trim().to_string();
                if name.is_empty() {
                    return Err(FinError::invalid("objective.weights contains empty metric name"));
                }
                let weight =
                    coerce_f64(value, &format!("objective.weights[{}]", name))?;
                weights.insert(name, weight);
            }
            weights
        }
    };

    Ok(Objective {
        metric,
        maximize,
        weights,
    })
}

fn normalize_choice(name: &str, raw: &Value) -> FinResult<ParameterSpec> {
    let values = raw
        .as_array()
        .ok_or_else(|| FinError::invalid(format!("{}: choice parameters must be an array", name)))?;
    if values.is_empty() {
        return Err(FinError::invalid(format!("{}: choice list must not be empty", name)));
    }
    Ok(ParameterSpec {
        name: name.to_string(),
        kind: ParamKind::Choice,
        min_value: 0.0,
        max_value: 0.0,
        values: values.clone(),
        step: None,
    })
}

fn normalize_range(name: &str, cfg: &Value, int_kind: bool) -> FinResult<ParameterSpec> {
    let min_value = cfg
        .get("min")
        .ok_or_else(|| FinError::invalid(format!("{}: range specs require min and max", name)))?;
    let max_value = cfg
        .get("max")
        .ok_or_else(|| FinError::invalid(format!("{}: range specs require min and max", name)))?;
    let min_f = coerce_f64(min_value, &format!("{}.min", name))?;
    let max_f = coerce_f64(max_value, &format!("{}.max", name))?;
    if max_f < min_f {
        return Err(FinError::invalid(format!("{}: max must be >= min", name)));
    }
    let step = match cfg.get("step") {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let step = coerce_f64(raw, &format!("{}.step", name))?;
            if step <= 0.0 {
                return Err(FinError::invalid(format!("{}.step must be positive", name)));
            }
            Some(step)
        }
    };
    if int_kind && (min_f.fract() != 0.0 || max_f.fract() != 0.0) {
        return Err(FinError::invalid(format!(
            "{}: int_range min and max must be integer values",
            name
        )));
    }
    Ok(ParameterSpec {
        name: name.to_string(),
        kind: if int_kind {
            ParamKind::IntRange
        } else {
            ParamKind::FloatRange
        },
        min_value: min_f,
        max_value: max_f,
        values: Vec::new(),
        step,
    })
}

fn parse_search_space(raw: &Value) -> FinResult<Vec<ParameterSpec>> {
    let map = raw
        .as_object()
        .ok_or_else(|| FinError::invalid("search_space must be an object"))?;
    if map.is_empty() {
        return Err(FinError::invalid("search_space must include at least one parameter"));
    }

    let mut specs = Vec::new();
    for (name, cfg) in map {
        let name = name.trim();
        if name.is_empty() {
            return Err(FinError::invalid("search_space contains empty parameter name"));
        }
        if let Some(obj) = cfg.as_object() {
            if let Some(choices) = obj.get("choices") {
                specs.push(normalize_choice(name, choices)?);
                continue;
            }
            if obj.contains_key("values") && !obj.contains_key("type") && !obj.contains_key("kind")
            {
                specs.push(normalize_choice(name, &obj["values"])?);
                continue;
            }
            let kind = obj
                .get("type")
                .or_else(|| obj.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("float_range")
                .trim()
                .to_lowercase();
            match kind.as_str() {
                "choice" | "choices" | "categorical" => {
                    let values = obj.get("values").ok_or_else(|| {
                        FinError::invalid(format!("{}: {} requires 'values'", name, kind))
                    })?;
                    specs.push(normalize_choice(name, values)?);
                }
                "int" | "int_range" => specs.push(normalize_range(name, cfg, true)?),
                "float" | "float_range" => specs.push(normalize_range(name, cfg, false)?),
                other => {
                    return Err(FinError::invalid(format!(
                        "{}: unsupported type '{}'",
                        name, other
                    )));
                }
            }
            continue;
        }
        specs.push(normalize_choice(name, cfg)?);
    }
    Ok(specs)
}

fn round_to_step(value: f64, step: Option<f64>) -> f64 {
    match step {
        Some(step) if step > 0.0 => {
            let snapped = (value / step).round() * step;
            (snapped * 1e10).round() / 1e10
        }
        _ => value,
    }
}

fn coerce_for_grid(spec: &ParameterSpec, value: f64) -> Value {
    match spec.kind {
        ParamKind::IntRange => json!(round_to_step(value, spec.step).round() as i64),
        _ => json!(round_to_step(value, spec.step)),
    }
}

fn dedupe_values(values: Vec<Value>) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in values {
        let key = value.to_string();
        if seen.insert(key) {
            out.push(value);
        }
    }
    out
}

fn candidate_values(
    spec: &ParameterSpec,
    layer: usize,
    anchors: Option<&[Value]>,
) -> FinResult<Vec<Value>> {
    if spec.kind == ParamKind::Choice {
        return Ok(dedupe_values(spec.values.clone()));
    }

    let min_value = spec.min_value;
    let max_value = spec.max_value;
    let span = max_value - min_value;

    if let Some(step) = spec.step {
        let mut values = Vec::new();
        let mut current = min_value;
        while current <= max_value + 1e-12 {
            values.push(coerce_for_grid(spec, current));
            current += step;
        }
        let max_coerced = coerce_for_grid(spec, max_value);
        if values.last() != Some(&max_coerced) {
            values.push(max_coerced);
        }
        return Ok(dedupe_values(values));
    }

    if span == 0.0 {
        return Ok(vec![coerce_for_grid(spec, min_value)]);
    }

    let probes = || {
        vec![
            coerce_for_grid(spec, min_value),
            coerce_for_grid(spec, min_value + span / 2.0),
            coerce_for_grid(spec, max_value),
        ]
    };

    let Some(anchors) = anchors.filter(|a| !a.is_empty()) else {
        return Ok(dedupe_values(probes()));
    };

    let radius = span / 2f64.powi(layer as i32 + 1);
    let mut values: BTreeSet<String> = BTreeSet::new();
    let mut collected: Vec<f64> = Vec::new();
    for anchor in anchors {
        let Some(anchor_value) = anchor.get(&spec.name).and_then(Value::as_f64) else {
            continue;
        };
        for delta in [0.0, -radius, radius] {
            let candidate = (anchor_value + delta).clamp(min_value, max_value);
            if values.insert(format!("{:.12}", candidate)) {
                collected.push(candidate);
            }
        }
    }
    if collected.is_empty() {
        return Ok(dedupe_values(probes()));
    }
    collected.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(dedupe_values(
        collected
            .into_iter()
            .map(|value| coerce_for_grid(spec, value))
            .collect(),
    ))
}

fn generate_param_grid(
    specs: &[ParameterSpec],
    layer: usize,
    anchors: Option<&[Value]>,
) -> FinResult<Vec<Value>> {
    let mut per_param: Vec<Vec<Value>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let values = candidate_values(spec, layer, anchors)?;
        if values.is_empty() {
            return Err(FinError::invalid(format!(
                "failed to generate values for parameter '{}'",
                spec.name
            )));
        }
        per_param.push(values);
    }

    let mut grid: Vec<Value> = vec![json!({})];
    for (spec, values) in specs.iter().zip(per_param.iter()) {
        let mut next = Vec::with_capacity(grid.len() * values.len());
        for base in &grid {
            for value in values {
                let mut combo = base.clone();
                combo[spec.name.as_str()] = value.clone();
                next.push(combo);
            }
        }
        grid = next;
    }
    Ok(grid)
}

fn candidate_key(candidate: &Value) -> String {
    let sorted: BTreeMap<String, Value> = candidate
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn score_candidate(metrics: &Value, objective: &Objective) -> FinResult<(f64, String)> {
    let mut score = 0.0;
    let mut used = Vec::new();
    for (metric, weight) in &objective.weights {
        let Some(raw) = metrics.get(metric) else {
            continue;
        };
        let value = coerce_f64(raw, &format!("metrics[{}]", metric))?;
        score += weight * metric_direction(metric) * value;
        used.push(metric.clone());
    }
    if used.is_empty() {
        return Err(FinError::invalid(
            "objective cannot be computed; no candidate metrics available",
        ));
    }
    Ok((score, used.join(",")))
}

/// Domain invariant pre-check on a candidate. Returns a rejection reason.
fn domain_violation(candidate: &Value, universe_len: usize) -> Option<String> {
    let short = candidate.get("short_window").and_then(Value::as_f64);
    let long = candidate.get("long_window").and_then(Value::as_f64);
    if let (Some(short), Some(long)) = (short, long) {
        if short >= long {
            return Some("invalid_windows_short_must_be_less_than_long".to_string());
        }
    }
    if let Some(max_positions) = candidate.get("max_positions").and_then(Value::as_f64) {
        if (universe_len as f64) > max_positions {
            return Some("max_positions_below_universe_size".to_string());
        }
    }
    None
}

fn constraint_violation(metrics: &Value, constraints: &TuningConstraints) -> Option<String> {
    if let Some(limit) = constraints.max_drawdown_limit {
        let drawdown = metrics
            .get("max_drawdown")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if drawdown.abs() > limit {
            return Some(format!(
                "max_drawdown_limit_exceeded:{:.6}>{:.6}",
                drawdown, limit
            ));
        }
    }
    if let Some(cap) = constraints.turnover_cap {
        let trades = metrics
            .get("trade_count")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if trades > cap {
            return Some(format!("turnover_cap_exceeded:{}>{}", trades, cap));
        }
    }
    None
}

/// Best rival differing only in one parameter, per tunable parameter.
fn sensitivity_analysis(evaluated: &[Value], best: &Value, metric: &str) -> Value {
    let baseline_params = best.get("params").cloned().unwrap_or(json!({}));
    let baseline_score = best.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    let param_names: Vec<String> = baseline_params
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    let mut sensitivity = serde_json::Map::new();
    for param in &param_names {
        let mut comparables: Vec<&Value> = Vec::new();
        for row in evaluated {
            let params = row.get("params").cloned().unwrap_or(json!({}));
            if params.get(param) == baseline_params.get(param) {
                continue;
            }
            let same_context = param_names.iter().all(|other| {
                other == param || params.get(other) == baseline_params.get(other)
            });
            if same_context {
                comparables.push(row);
            }
        }

        if comparables.is_empty() {
            sensitivity.insert(
                param.clone(),
                json!({
                    "metric": metric,
                    "baseline_value": baseline_params.get(param),
                    "status": "insufficient_local_samples",
                }),
            );
            continue;
        }

        let best_alternative = comparables
            .iter()
            .max_by(|a, b| {
                let sa = a.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
                let sb = b.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .unwrap_or(best);
        let alt_score = best_alternative
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        sensitivity.insert(
            param.clone(),
            json!({
                "metric": metric,
                "baseline_value": baseline_params.get(param),
                "alternative_value": best_alternative["params"].get(param),
                "baseline_score": baseline_score,
                "alternative_score": alt_score,
                "score_delta": alt_score - baseline_score,
                "alternative_run_id": best_alternative.get("run_id"),
                "status": "ok",
            }),
        );
    }
    Value::Object(sensitivity)
}

fn emit(callback: Option<EventCallback<'_>>, event: Value) {
    if let Some(callback) = callback {
        callback(&event);
    }
}

/// Run the layered search. Returns the aggregate tuning payload; persistence
/// is the caller's concern (see [`run_and_persist_tuning`]).
pub async fn tune_strategy(
    request: &TuneRequest,
    runner: &dyn CandidateRunner,
    callback: Option<EventCallback<'_>>,
) -> FinResult<Value> {
    if request.strategy_name.trim().is_empty() {
        return Err(FinError::invalid("strategy_name is required"));
    }
    if request.source_code.trim().is_empty() {
        return Err(FinError::invalid("source_code is required"));
    }
    if request.universe.is_empty() {
        return Err(FinError::invalid("universe is required"));
    }
    if request.max_trials == 0 {
        return Err(FinError::invalid("max_trials must be positive"));
    }
    if request.max_layers == 0 {
        return Err(FinError::invalid("max_layers must be positive"));
    }
    if request.keep_top == 0 {
        return Err(FinError::invalid("keep_top must be positive"));
    }
    if request.max_trials_per_layer == Some(0) {
        return Err(FinError::invalid("max_trials_per_layer must be positive"));
    }

    let objective = parse_objective(request.objective.as_ref())?;
    let specs = parse_search_space(&request.search_space)?;
    let tuning_run_id = request
        .tuning_run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let mut candidate_plan: Vec<Value> = Vec::new();
    for spec in &specs {
        let values = candidate_values(spec, 0, None)?;
        candidate_plan.push(json!({
            "parameter": spec.name,
            "kind": match spec.kind {
                ParamKind::Choice => "choice",
                ParamKind::IntRange => "int_range",
                ParamKind::FloatRange => "float_range",
            },
            "sample_count": values.len(),
            "sample_values": values.iter().take(12).collect::<Vec<_>>(),
        }));
    }

    emit(
        callback,
        json!({
            "event": "tuning.plan.ready",
            "requested_trials": request.max_trials,
            "max_layers": request.max_layers,
            "keep_top": request.keep_top,
            "candidate_plan": candidate_plan,
        }),
    );

    let objective_payload = json!({
        "metric": objective.metric,
        "maximize": objective.maximize,
        "weights": objective.weights,
    });
    if request.only_plan {
        return Ok(json!({
            "tuning_run_id": tuning_run_id,
            "strategy_name": request.strategy_name,
            "status": "planned",
            "objective": objective_payload,
            "evaluated_candidates": [],
            "rejected_candidates": [],
            "best_candidate": Value::Null,
            "tuning_plan": {"layers": [], "candidate_plan": candidate_plan},
            "trials_attempted": 0,
            "trials_requested": request.max_trials,
        }));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(request.random_seed.unwrap_or(0));
    let mut evaluated: Vec<Value> = Vec::new();
    let mut rejected: Vec<Value> = Vec::new();
    let mut layer_decisions: Vec<Value> = Vec::new();
    let mut best_candidate: Option<Value> = None;
    let mut seen_params: BTreeSet<String> = BTreeSet::new();
    let mut anchors: Vec<Value> = Vec::new();
    let mut remaining_trials = request.max_trials as i64;

    for layer in 0..request.max_layers {
        if remaining_trials <= 0 {
            break;
        }

        let anchor_slice = if anchors.is_empty() {
            None
        } else {
            Some(anchors.as_slice())
        };
        let mut candidates = generate_param_grid(&specs, layer, anchor_slice)?;
        if candidates.is_empty() {
            break;
        }
        if let Some(cap) = request.max_trials_per_layer {
            candidates.truncate(cap);
        }

        use rand::seq::SliceRandom;
        candidates.shuffle(&mut rng);

        let mut selected: Vec<Value> = Vec::new();
        for candidate in candidates {
            let key = candidate_key(&candidate);
            if seen_params.contains(&key) {
                continue;
            }
            seen_params.insert(key);
            if let Some(reason) = domain_violation(&candidate, request.universe.len()) {
                rejected.push(json!({"params": candidate, "reason": reason, "layer": layer}));
                continue;
            }
            selected.push(candidate);
            if selected.len() as i64 >= remaining_trials {
                break;
            }
        }
        if selected.is_empty() {
            break;
        }

        emit(
            callback,
            json!({
                "event": "tuning.layer.started",
                "layer": layer,
                "requested": selected.len(),
                "remaining_trials": remaining_trials,
            }),
        );

        let mut layer_results: Vec<Value> = Vec::new();
        for (index, params) in selected.iter().enumerate() {
            let seed: i64 = rng.gen_range(i64::from(i32::MIN)..i64::from(i32::MAX));
            let run = match runner.run(request, params, seed).await {
                Ok(run) => run,
                Err(err) => {
                    emit(
                        callback,
                        json!({
                            "event": "tuning.candidate.failed",
                            "layer": layer,
                            "candidate_index": index,
                            "params": params,
                            "error": err.to_string(),
                        }),
                    );
                    continue;
                }
            };
            remaining_trials -= 1;

            let metrics = run.get("metrics").cloned().unwrap_or(json!({}));
            if let Some(reason) = constraint_violation(&metrics, &request.constraints) {
                rejected.push(json!({
                    "params": params,
                    "reason": reason,
                    "run_id": run.get("run_id"),
                    "layer": layer,
                }));
                continue;
            }

            let (score, score_metric) = score_candidate(&metrics, &objective)?;
            let candidate = json!({
                "run_id": run.get("run_id"),
                "params": params,
                "metrics": metrics,
                "score": score,
                "score_metric": score_metric,
                "layer": layer,
            });
            evaluated.push(candidate.clone());
            layer_results.push(candidate.clone());

            emit(
                callback,
                json!({
                    "event": "tuning.candidate.evaluated",
                    "layer": layer,
                    "candidate_index": index,
                    "params": params,
                    "metrics": candidate["metrics"],
                    "score": score,
                    "run_id": candidate["run_id"],
                }),
            );

            if remaining_trials <= 0 {
                break;
            }
        }

        if layer_results.is_empty() {
            break;
        }

        layer_results.sort_by(|a, b| {
            let sa = a.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
            let sb = b.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        let top: Vec<Value> = layer_results
            .iter()
            .take(request.keep_top)
            .cloned()
            .collect();
        anchors = top
            .iter()
            .filter_map(|row| row.get("params").cloned())
            .collect();
        layer_decisions.push(json!({
            "layer": format!("layer_{}", layer),
            "enabled": true,
            "reason": format!(
                "evaluated {} candidates, retained top {}",
                selected.len(),
                top.len()
            ),
            "candidate_count": selected.len(),
            "layer_kept": top.len(),
        }));

        let best_for_layer = top[0].clone();
        let layer_best_score = best_for_layer
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(f64::MIN);
        let current_best_score = best_candidate
            .as_ref()
            .and_then(|b| b.get("score"))
            .and_then(Value::as_f64);
        if current_best_score.map_or(true, |s| layer_best_score > s) {
            best_candidate = Some(best_for_layer.clone());
        }

        emit(
            callback,
            json!({
                "event": "tuning.layer.completed",
                "layer": layer,
                "best_score": layer_best_score,
                "attempted": layer_results.len(),
            }),
        );
    }

    let Some(best) = best_candidate else {
        return Err(FinError::invalid(
            "tuning produced zero valid candidates under active constraints; \
             remediation: relax constraints or expand search_space",
        ));
    };

    let sensitivity = sensitivity_analysis(&evaluated, &best, &objective.metric);
    let mut top_candidates = evaluated.clone();
    top_candidates.sort_by(|a, b| {
        let sa = a.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
        let sb = b.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    top_candidates.truncate(5);

    Ok(json!({
        "tuning_run_id": tuning_run_id,
        "strategy_name": request.strategy_name,
        "status": "completed",
        "objective": objective_payload,
        "search_space": request.search_space,
        "constraints": {
            "max_drawdown_limit": request.constraints.max_drawdown_limit,
            "turnover_cap": request.constraints.turnover_cap,
        },
        "evaluated_candidates": evaluated,
        "rejected_candidates": rejected,
        "best_candidate": best,
        "top_candidates": top_candidates,
        "sensitivity_analysis": sensitivity,
        "tuning_plan": {
            "layers": layer_decisions,
            "candidate_plan": candidate_plan,
        },
        "trials_attempted": evaluated.len(),
        "trials_requested": request.max_trials,
    }))
}

/// Synchronous pathway: run the search, persist the run with its decomposed
/// trial and layer-decision rows, and append the audit event.
pub async fn run_and_persist_tuning(
    state: &StateStore,
    request: &TuneRequest,
    runner: &dyn CandidateRunner,
    callback: Option<EventCallback<'_>>,
) -> FinResult<Value> {
    let payload = tune_strategy(request, runner, callback).await?;
    state.save_tuning_run(&request.strategy_name, &payload)?;
    state.append_audit_event(
        "tuning.run",
        &json!({
            "tuning_run_id": payload["tuning_run_id"],
            "strategy_name": request.strategy_name,
            "trials_attempted": payload["trials_attempted"],
            "best_run_id": payload["best_candidate"]["run_id"],
            "objective": payload["objective"]["metric"],
        }),
    )?;
    Ok(payload)
}
