//! Per-provider sliding-window rate limiter.
//!
//! A process-wide lock protects a per-provider list of monotonic timestamps.
//! Each call drops timestamps older than the window; at capacity the call
//! fails with the seconds remaining until the oldest timestamp expires.
//! Backpressure is expressed as failure, never queuing.

use std::collections::HashMap;
use std::time::Instant;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{FinError, FinResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProviderLimit {
    pub max_requests: usize,
    pub window_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub provider: String,
    pub max_requests: usize,
    pub window_seconds: f64,
    pub remaining_in_window: usize,
}

lazy_static! {
    static ref STATE: Mutex<HashMap<String, Vec<Instant>>> = Mutex::new(HashMap::new());
}

fn read_usize_env(name: &str, default: usize) -> FinResult<usize> {
    let raw = std::env::var(name).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(default);
    }
    let value: i64 = raw
        .parse()
        .map_err(|_| FinError::invalid(format!("invalid {}: {}", name, raw)))?;
    if value <= 0 {
        return Err(FinError::invalid(format!("{} must be positive", name)));
    }
    Ok(value as usize)
}

fn read_f64_env(name: &str, default: f64) -> FinResult<f64> {
    let raw = std::env::var(name).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(default);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| FinError::invalid(format!("invalid {}: {}", name, raw)))?;
    if value <= 0.0 {
        return Err(FinError::invalid(format!("{} must be positive", name)));
    }
    Ok(value)
}

/// Provider configuration from environment, with per-provider defaults.
pub fn provider_limit(provider: &str) -> FinResult<ProviderLimit> {
    let key = provider.trim().to_lowercase();
    let (max_default, window_default, prefix) = match key.as_str() {
        "kite" => (20, 1.0, "KITE"),
        "nse" => (10, 1.0, "NSE"),
        "tradingview" => (5, 1.0, "TRADINGVIEW"),
        _ => {
            return Err(FinError::invalid(format!(
                "unsupported provider for rate limit: {}",
                provider
            )));
        }
    };
    Ok(ProviderLimit {
        max_requests: read_usize_env(
            &format!("FIN_AGENT_RATE_LIMIT_{}_MAX_REQUESTS", prefix),
            max_default,
        )?,
        window_seconds: read_f64_env(
            &format!("FIN_AGENT_RATE_LIMIT_{}_WINDOW_SECONDS", prefix),
            window_default,
        )?,
    })
}

/// Record one call against the provider window or fail with
/// `retry_after_seconds`.
pub fn enforce_provider_limit(provider: &str) -> FinResult<RateLimitStatus> {
    let cfg = provider_limit(provider)?;
    let now = Instant::now();
    let mut state = STATE.lock();
    let timestamps = state.entry(provider.to_string()).or_default();
    timestamps.retain(|t| now.duration_since(*t).as_secs_f64() < cfg.window_seconds);
    if timestamps.len() >= cfg.max_requests {
        let oldest = timestamps[0];
        let retry_after_seconds =
            (cfg.window_seconds - now.duration_since(oldest).as_secs_f64()).max(0.0);
        return Err(FinError::RateLimited {
            provider: provider.to_string(),
            retry_after_seconds,
        });
    }
    timestamps.push(now);
    let remaining = cfg.max_requests - timestamps.len();
    Ok(RateLimitStatus {
        provider: provider.to_string(),
        max_requests: cfg.max_requests,
        window_seconds: cfg.window_seconds,
        remaining_in_window: remaining,
    })
}

/// Clear all windows (tests).
pub fn reset_rate_limits() {
    STATE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exhaustion_surfaces_retry_after() {
        reset_rate_limits();
        std::env::set_var("FIN_AGENT_RATE_LIMIT_KITE_MAX_REQUESTS", "1");
        std::env::set_var("FIN_AGENT_RATE_LIMIT_KITE_WINDOW_SECONDS", "60");

        let first = enforce_provider_limit("kite").unwrap();
        assert_eq!(first.remaining_in_window, 0);

        let err = enforce_provider_limit("kite").unwrap_err();
        match &err {
            FinError::RateLimited {
                provider,
                retry_after_seconds,
            } => {
                assert_eq!(provider, "kite");
                assert!(*retry_after_seconds <= 60.0);
                assert!(*retry_after_seconds > 55.0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert!(err.to_string().starts_with("provider_rate_limited provider=kite"));

        std::env::remove_var("FIN_AGENT_RATE_LIMIT_KITE_MAX_REQUESTS");
        std::env::remove_var("FIN_AGENT_RATE_LIMIT_KITE_WINDOW_SECONDS");
        reset_rate_limits();
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = enforce_provider_limit("bloomberg").unwrap_err();
        assert!(err.to_string().contains("unsupported provider"));
    }

    #[test]
    fn test_env_overrides_validated() {
        std::env::set_var("FIN_AGENT_RATE_LIMIT_NSE_MAX_REQUESTS", "zero");
        assert!(provider_limit("nse").is_err());
        std::env::set_var("FIN_AGENT_RATE_LIMIT_NSE_MAX_REQUESTS", "0");
        assert!(provider_limit("nse").is_err());
        std::env::remove_var("FIN_AGENT_RATE_LIMIT_NSE_MAX_REQUESTS");
        let cfg = provider_limit("nse").unwrap();
        assert_eq!(cfg.max_requests, 10);
    }
}
