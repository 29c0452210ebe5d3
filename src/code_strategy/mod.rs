pub mod backtest;
pub mod runner;
pub mod validator;
pub mod worker;

pub use backtest::{run_code_strategy_backtest, CodeBacktestRequest};
pub use runner::{run_code_strategy_sandbox, SandboxLimits, SandboxOutcome, WORKER_BIN_ENV};
pub use validator::validate_code_strategy_source;
pub use worker::run_sandbox_worker;
