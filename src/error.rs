//! Crate-wide error taxonomy.
//!
//! Every operation surfaces one of these kinds synchronously; the API layer
//! maps kinds to HTTP statuses and renders `{code, detail, remediation?}`
//! bodies. Long-running jobs record the rendered error on the job row.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub type FinResult<T> = Result<T, FinError>;

/// Stable error kinds shared across the whole backend.
#[derive(Debug, Clone)]
pub enum FinError {
    /// Client-visible precondition violation (schema, enum, range, empty input).
    Invalid(String),
    /// Keyed lookup miss.
    NotFound(String),
    /// Uniqueness / version / already-consumed violation.
    Conflict(String),
    /// Preflight refusal.
    BudgetExceeded(String),
    /// Per-provider window exceeded.
    RateLimited {
        provider: String,
        retry_after_seconds: f64,
    },
    /// Sandbox wall-clock limit hit.
    SandboxTimeout(String),
    /// Sandbox CPU/address-space limit hit.
    SandboxResourceExceeded(String),
    /// Sandbox filesystem policy violation.
    SandboxPolicy(String),
    /// Upstream credential invalid or expired.
    ReauthRequired(String),
    /// Network error against a provider.
    UpstreamUnavailable(String),
    /// Disk or database I/O failure.
    Io(String),
    /// Invariant violation.
    Internal(String),
}

impl FinError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::Invalid(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Stable machine-readable code for API bodies and job rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::RateLimited { .. } => "provider_rate_limited",
            Self::SandboxTimeout(_) => "sandbox_timeout",
            Self::SandboxResourceExceeded(_) => "sandbox_resource_exceeded",
            Self::SandboxPolicy(_) => "sandbox_policy",
            Self::ReauthRequired(_) => "reauth_required",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Invalid(_)
            | Self::BudgetExceeded(_)
            | Self::SandboxTimeout(_)
            | Self::SandboxResourceExceeded(_)
            | Self::SandboxPolicy(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ReauthRequired(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for FinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(d)
            | Self::NotFound(d)
            | Self::Conflict(d)
            | Self::BudgetExceeded(d)
            | Self::SandboxTimeout(d)
            | Self::SandboxResourceExceeded(d)
            | Self::SandboxPolicy(d)
            | Self::ReauthRequired(d)
            | Self::UpstreamUnavailable(d)
            | Self::Io(d)
            | Self::Internal(d) => write!(f, "{}", d),
            Self::RateLimited {
                provider,
                retry_after_seconds,
            } => write!(
                f,
                "provider_rate_limited provider={} retry_after_seconds={:.3}",
                provider, retry_after_seconds
            ),
        }
    }
}

impl std::error::Error for FinError {}

impl From<rusqlite::Error> for FinError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".to_string()),
            other => Self::Io(format!("sqlite error: {}", other)),
        }
    }
}

impl From<duckdb::Error> for FinError {
    fn from(e: duckdb::Error) -> Self {
        Self::Io(format!("duckdb error: {}", e))
    }
}

impl From<serde_json::Error> for FinError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json serialization error: {}", e))
    }
}

impl From<std::io::Error> for FinError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(format!("io error: {}", e))
    }
}

impl IntoResponse for FinError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "code": self.code(),
            "detail": self.to_string(),
        });
        if let Self::RateLimited {
            provider,
            retry_after_seconds,
        } = &self
        {
            body["provider"] = serde_json::json!(provider);
            body["retry_after_seconds"] = serde_json::json!(retry_after_seconds);
            body["remediation"] =
                serde_json::json!("retry after the suggested delay or reduce polling frequency");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(FinError::invalid("x").code(), "invalid");
        assert_eq!(FinError::not_found("x").code(), "not_found");
        assert_eq!(FinError::conflict("x").code(), "conflict");
        assert_eq!(
            FinError::RateLimited {
                provider: "kite".into(),
                retry_after_seconds: 1.0
            }
            .code(),
            "provider_rate_limited"
        );
    }

    #[test]
    fn test_rate_limited_display_carries_retry_after() {
        let err = FinError::RateLimited {
            provider: "kite".into(),
            retry_after_seconds: 0.75,
        };
        let text = err.to_string();
        assert!(text.contains("provider=kite"));
        assert!(text.contains("retry_after_seconds=0.750"));
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err: FinError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), "not_found");
    }
}
