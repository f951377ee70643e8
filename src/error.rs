use std::time::Duration;

use thiserror::Error;

/// Closed error set for the engine. Every failure a component can surface is
/// one of these; retry ladders decide on `is_transient`, the HTTP layer maps
/// through `http_status`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("throttled, retry after {}s", retry_after.as_secs())]
    Throttled { retry_after: Duration },
    #[error("timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("bad model response: {0}")]
    BadResponse(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("delegation cycle: {0}")]
    CycleDetected(String),
    #[error("delegation depth exceeded")]
    DepthExceeded,
    #[error("no usable sources")]
    NoSources,
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Transient failures are retried by the model client, the researcher,
    /// and the worker pool. Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout | EngineError::Throttled { .. } | EngineError::Provider(_)
        )
    }

    /// Stable machine-readable tag, stored on failed task records so the
    /// HTTP layer can reconstruct a status code later.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::PayloadTooLarge(_) => "payload_too_large",
            EngineError::Throttled { .. } => "throttled",
            EngineError::Timeout => "timeout",
            EngineError::Provider(_) => "provider_error",
            EngineError::BadResponse(_) => "bad_response",
            EngineError::UnknownAgent(_) => "unknown_agent",
            EngineError::CycleDetected(_) => "cycle_detected",
            EngineError::DepthExceeded => "depth_exceeded",
            EngineError::NoSources => "no_sources",
            EngineError::Cancelled => "cancelled",
            EngineError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        status_for_kind(self.kind())
    }
}

/// HTTP status for a stored error kind tag. Shared between live errors and
/// task records read back from the store.
pub fn status_for_kind(kind: &str) -> u16 {
    match kind {
        "bad_request" | "cycle_detected" | "depth_exceeded" => 400,
        "unauthorized" => 401,
        "not_found" | "unknown_agent" | "no_sources" => 404,
        "conflict" => 409,
        "payload_too_large" => 413,
        "timeout" => 408,
        "throttled" => 429,
        "provider_error" | "bad_response" => 502,
        "cancelled" => 409,
        _ => 500,
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("store: {e}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_is_exactly_timeout_throttled_provider() {
        assert!(EngineError::Timeout.is_transient());
        assert!(
            EngineError::Throttled {
                retry_after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(EngineError::Provider("upstream 503".into()).is_transient());

        assert!(!EngineError::BadResponse("empty".into()).is_transient());
        assert!(!EngineError::UnknownAgent("nobody".into()).is_transient());
        assert!(!EngineError::DepthExceeded.is_transient());
        assert!(!EngineError::Cancelled.is_transient());
        assert!(!EngineError::Internal("x".into()).is_transient());
    }

    #[test]
    fn kind_round_trips_through_status_mapping() {
        let cases = [
            (EngineError::BadRequest("x".into()), 400),
            (EngineError::Unauthorized("x".into()), 401),
            (EngineError::NotFound("x".into()), 404),
            (EngineError::Conflict("x".into()), 409),
            (EngineError::PayloadTooLarge(3_000_000), 413),
            (EngineError::Timeout, 408),
            (
                EngineError::Throttled {
                    retry_after: Duration::from_secs(5),
                },
                429,
            ),
            (EngineError::Provider("x".into()), 502),
            (EngineError::UnknownAgent("x".into()), 404),
            (EngineError::Internal("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.http_status(), status, "{err}");
            assert_eq!(status_for_kind(err.kind()), status);
        }
    }
}
