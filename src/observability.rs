//! Ambient trace-id context and the structured request log.
//!
//! Every request acquires (or inherits via `x-trace-id`) a hex trace id that
//! is installed in a task-scoped context for the duration of the request and
//! propagated into structured log rows and audit event payloads. The
//! structured log is a JSONL file with stable (sorted) key order.

use std::io::Write;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;
use uuid::Uuid;

use crate::security::redact_payload;
use crate::storage::paths::RuntimePaths;

tokio::task_local! {
    static TRACE_ID: String;
}

/// The ambient trace id, or `no-trace` outside a request scope.
pub fn get_trace_id() -> String {
    TRACE_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| "no-trace".to_string())
}

/// Run `fut` with `trace_id` installed as the ambient trace id.
pub async fn with_trace_id<F, T>(trace_id: String, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE_ID.scope(trace_id, fut).await
}

/// Append one structured log row. Keys are sorted by serde_json's map order;
/// the ambient trace id is always attached and secrets are masked.
pub fn write_structured_log(paths: &RuntimePaths, event_type: &str, payload: Value) {
    if paths.ensure().is_err() {
        return;
    }
    let mut row = serde_json::Map::new();
    row.insert("event_type".to_string(), Value::String(event_type.to_string()));
    row.insert("trace_id".to_string(), Value::String(get_trace_id()));
    if let Value::Object(map) = redact_payload(&payload) {
        for (key, value) in map {
            row.insert(key, value);
        }
    }
    let line = match serde_json::to_string(&Value::Object(row)) {
        Ok(line) => line,
        Err(_) => return,
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.structured_log_path())
        .and_then(|mut handle| writeln!(handle, "{}", line));
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to append structured log row");
    }
}

/// Aggregate stats over the structured log for `/v1/observability/metrics`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StructuredLogStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_request_duration_ms: f64,
}

pub fn read_structured_log_stats(paths: &RuntimePaths) -> StructuredLogStats {
    let log_path = paths.structured_log_path();
    let Ok(content) = std::fs::read_to_string(&log_path) else {
        return StructuredLogStats {
            request_count: 0,
            error_count: 0,
            avg_request_duration_ms: 0.0,
        };
    };
    let mut request_count = 0u64;
    let mut error_count = 0u64;
    let mut durations: Vec<f64> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(row) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let event_type = row.get("event_type").and_then(Value::as_str).unwrap_or("");
        if event_type == "request.end" {
            request_count += 1;
            durations.push(row.get("duration_ms").and_then(Value::as_f64).unwrap_or(0.0));
        }
        if event_type.ends_with("error") {
            error_count += 1;
        }
    }
    let avg = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    StructuredLogStats {
        request_count,
        error_count,
        avg_request_duration_ms: (avg * 10_000.0).round() / 10_000.0,
    }
}

/// Axum middleware: install the trace id, log request start/end/error rows,
/// and echo the trace id back in the `x-trace-id` response header.
pub async fn trace_logging_middleware(
    State(paths): State<RuntimePaths>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let trace_id = request
        .headers()
        .get("x-trace-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    with_trace_id(trace_id.clone(), async move {
        let started = Instant::now();
        write_structured_log(
            &paths,
            "request.start",
            serde_json::json!({"method": method.as_str(), "path": path}),
        );

        let mut response = next.run(request).await;
        let status_code = response.status().as_u16();
        if status_code >= 500 {
            write_structured_log(
                &paths,
                "request.error",
                serde_json::json!({
                    "method": method.as_str(),
                    "path": path,
                    "error": format!("status {}", status_code),
                    "remediation": "check structured.log with same trace_id and inspect failing endpoint payload",
                }),
            );
        }
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        write_structured_log(
            &paths,
            "request.end",
            serde_json::json!({
                "method": method.as_str(),
                "path": path,
                "status_code": status_code,
                "duration_ms": (duration_ms * 1000.0).round() / 1000.0,
            }),
        );
        if let Ok(header_value) = trace_id.parse() {
            response.headers_mut().insert("x-trace-id", header_value);
        }
        response
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_defaults_outside_scope() {
        assert_eq!(get_trace_id(), "no-trace");
    }

    #[tokio::test]
    async fn test_trace_id_scoped() {
        let seen = with_trace_id("abc123".to_string(), async { get_trace_id() }).await;
        assert_eq!(seen, "abc123");
        assert_eq!(get_trace_id(), "no-trace");
    }

    #[test]
    fn test_structured_log_stats() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        write_structured_log(&paths, "request.start", serde_json::json!({"path": "/x"}));
        write_structured_log(
            &paths,
            "request.end",
            serde_json::json!({"path": "/x", "duration_ms": 12.0, "status_code": 200}),
        );
        write_structured_log(
            &paths,
            "request.error",
            serde_json::json!({"path": "/x", "error": "boom"}),
        );
        let stats = read_structured_log_stats(&paths);
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.error_count, 1);
        assert!((stats.avg_request_duration_ms - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_structured_log_redacts_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        write_structured_log(
            &paths,
            "auth.exchange",
            serde_json::json!({"access_token": "tok_1234567890abcd"}),
        );
        let content = std::fs::read_to_string(paths.structured_log_path()).unwrap();
        assert!(!content.contains("tok_1234567890abcd"));
        assert!(content.contains("tok_...abcd"));
    }
}
