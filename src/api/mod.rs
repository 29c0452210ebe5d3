//! Public API surface: thin axum routing over the engines and stores.

pub mod data_routes;
pub mod ops_routes;
pub mod strategy_routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::observability::trace_logging_middleware;
use crate::storage::{AnalyticsStore, RuntimePaths, StateStore};

#[derive(Clone)]
pub struct AppState {
    pub paths: RuntimePaths,
    pub state: Arc<StateStore>,
    pub analytics: Arc<AnalyticsStore>,
}

impl AppState {
    pub fn open(paths: RuntimePaths) -> crate::error::FinResult<Self> {
        paths.ensure()?;
        let state = Arc::new(StateStore::open(&paths)?);
        let analytics = Arc::new(AnalyticsStore::open(&paths)?);
        Ok(Self {
            paths,
            state,
            analytics,
        })
    }
}

pub fn build_router(app: AppState) -> Router {
    let paths = app.paths.clone();
    Router::new()
        .route("/health", get(ops_routes::health))
        // Data ingest and PIT views
        .route("/v1/data/import", post(data_routes::import_ohlcv))
        .route(
            "/v1/data/import/fundamentals",
            post(data_routes::import_fundamentals),
        )
        .route(
            "/v1/data/import/corporate-actions",
            post(data_routes::import_corporate_actions),
        )
        .route("/v1/data/import/ratings", post(data_routes::import_ratings))
        .route(
            "/v1/data/fundamentals/as-of",
            post(data_routes::fundamentals_as_of),
        )
        .route(
            "/v1/data/technicals/compute",
            post(data_routes::technicals_compute),
        )
        .route("/v1/universe/resolve", post(data_routes::universe_resolve))
        // World state
        .route("/v1/world-state/build", post(data_routes::world_state_build))
        .route(
            "/v1/world-state/completeness",
            post(data_routes::world_state_completeness),
        )
        .route(
            "/v1/world-state/validate-pit",
            post(data_routes::world_state_validate_pit),
        )
        // Preflight
        .route(
            "/v1/preflight/world-state",
            post(data_routes::preflight_world_state),
        )
        .route("/v1/preflight/backtest", post(data_routes::preflight_backtest))
        .route("/v1/preflight/tuning", post(data_routes::preflight_tuning))
        .route(
            "/v1/preflight/custom-code",
            post(data_routes::preflight_custom_code),
        )
        // Screener
        .route(
            "/v1/screener/formula/validate",
            post(data_routes::screener_formula_validate),
        )
        .route("/v1/screener/run", post(data_routes::screener_run))
        // Code strategies
        .route(
            "/v1/code-strategy/validate",
            post(strategy_routes::code_strategy_validate),
        )
        .route("/v1/code-strategy/save", post(strategy_routes::code_strategy_save))
        .route("/v1/code-strategies", get(strategy_routes::code_strategies_list))
        .route(
            "/v1/code-strategies/:strategy_id/versions",
            get(strategy_routes::code_strategy_versions_list),
        )
        .route(
            "/v1/code-strategy/run-sandbox",
            post(strategy_routes::code_strategy_run_sandbox),
        )
        .route(
            "/v1/code-strategy/backtest",
            post(strategy_routes::code_strategy_backtest),
        )
        // Backtest runs
        .route("/v1/backtests/runs", get(strategy_routes::backtest_runs_list))
        .route(
            "/v1/backtests/runs/:run_id",
            get(strategy_routes::backtest_run_detail),
        )
        .route("/v1/backtests/compare", post(strategy_routes::backtest_compare))
        // Tuning
        .route("/v1/tuning/run", post(strategy_routes::tuning_run))
        .route("/v1/tuning/run-async", post(strategy_routes::tuning_run_async))
        .route("/v1/tuning/runs", get(strategy_routes::tuning_runs_list))
        .route(
            "/v1/tuning/runs/:tuning_run_id",
            get(strategy_routes::tuning_run_detail),
        )
        // Live lane
        .route("/v1/live/activate", post(strategy_routes::live_activate))
        .route("/v1/live/pause", post(strategy_routes::live_pause))
        .route("/v1/live/stop", post(strategy_routes::live_stop))
        .route("/v1/live/states", get(strategy_routes::live_states_list))
        .route(
            "/v1/live/states/:strategy_version_id",
            get(strategy_routes::live_state_detail),
        )
        .route("/v1/live/feed", get(strategy_routes::live_feed))
        .route(
            "/v1/live/boundary-candidates",
            get(strategy_routes::live_boundary_candidates),
        )
        .route("/v1/visualize/boundary", post(strategy_routes::visualize_boundary))
        // Jobs and events
        .route("/v1/jobs/:job_id", get(ops_routes::job_status))
        .route("/v1/events/jobs", get(ops_routes::stream_job_events))
        // Observability and diagnostics
        .route("/v1/providers/health", get(ops_routes::providers_health))
        .route(
            "/v1/observability/metrics",
            get(ops_routes::observability_metrics),
        )
        .route(
            "/v1/diagnostics/readiness",
            get(ops_routes::diagnostics_readiness),
        )
        .route("/v1/audit/events", get(ops_routes::audit_events))
        // Artifacts
        .route("/v1/artifacts", get(ops_routes::list_artifacts))
        .route("/v1/artifacts/file", get(ops_routes::get_artifact))
        // Session ledger
        .route("/v1/session/snapshot", post(ops_routes::session_snapshot))
        .route("/v1/session/rehydrate", post(ops_routes::session_rehydrate))
        .route("/v1/session/diff", get(ops_routes::session_diff))
        .route("/v1/context/delta", post(ops_routes::context_delta))
        .layer(axum::middleware::from_fn_with_state(
            paths,
            trace_logging_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(app)
}
