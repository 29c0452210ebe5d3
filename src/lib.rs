//! Fin-agent backend library.
//!
//! Single-tenant backend for building, executing, tuning and operating
//! code-authored trading strategies over point-in-time market data. Exposes
//! the engines, stores and API router for the `finagent` binary and tests.

pub mod api;
pub mod backtest;
pub mod code_strategy;
pub mod data;
pub mod error;
pub mod jobs;
pub mod live;
pub mod observability;
pub mod preflight;
pub mod rate_limit;
pub mod screener;
pub mod security;
pub mod session;
pub mod storage;
pub mod tuning;
pub mod viz;
pub mod world_state;

pub use api::{build_router, AppState};
pub use error::{FinError, FinResult};
pub use storage::RuntimePaths;
