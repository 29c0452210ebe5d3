//! Sandbox-backed candidate runner for the tuning engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::code_strategy::backtest::{run_code_strategy_backtest, CodeBacktestRequest};
use crate::error::FinResult;
use crate::storage::{AnalyticsStore, RuntimePaths, StateStore};
use crate::tuning::engine::{CandidateRunner, TuneRequest};

pub struct SandboxCandidateRunner {
    pub paths: RuntimePaths,
    pub analytics: Arc<AnalyticsStore>,
    pub state: Arc<StateStore>,
}

#[async_trait]
impl CandidateRunner for SandboxCandidateRunner {
    async fn run(&self, request: &TuneRequest, params: &Value, seed: i64) -> FinResult<Value> {
        let backtest_request = CodeBacktestRequest {
            strategy_name: request.strategy_name.clone(),
            source_code: request.source_code.clone(),
            universe: request.universe.clone(),
            start_date: request.start_date.clone(),
            end_date: request.end_date.clone(),
            initial_capital: request.initial_capital,
            limits: request.limits,
        };
        let extra_context = json!({
            "tuning_params": params,
            "base_context": request.context.clone().unwrap_or_else(|| json!({})),
            "seed": seed,
        });
        run_code_strategy_backtest(
            &self.paths,
            &self.analytics,
            &self.state,
            &backtest_request,
            Some(&extra_context),
        )
        .await
    }
}
