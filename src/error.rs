//! Gateway error taxonomy.
//!
//! Request-path failures are translated into JSON error responses with a
//! stable error code and the originating service name attached. Health-probe
//! failures never surface here; they only mutate health and circuit state.

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by registry operations and the request path.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown service name on any registry operation.
    #[error("service not found: {0}")]
    NotFound(String),

    /// No route matches the request path; not tied to any service.
    #[error("no route matches: {0}")]
    NoRoute(String),

    /// All instances in the chosen tier are unhealthy.
    #[error("no healthy instance for service: {0}")]
    NoHealthyInstance(String),

    /// Both tiers exhausted after one re-decision.
    #[error("no capacity in any tier for service: {0}")]
    NoCapacity(String),

    /// The circuit breaker is open; the backend was not contacted.
    #[error("circuit open for service: {0}")]
    CircuitOpen(String),

    /// The forwarded call exceeded its configured deadline.
    #[error("upstream timeout for service: {service}")]
    UpstreamTimeout { service: String },

    /// The forwarded call failed before a response was received.
    #[error("upstream error for service {service}: {message}")]
    UpstreamError { service: String, message: String },

    /// Malformed registration payload or request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status the error maps to at the gateway boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) | GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstance(_)
            | GatewayError::NoCapacity(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::UpstreamTimeout { .. }
            | GatewayError::UpstreamError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, distinct per variant so callers can
    /// tell "known bad" (circuit open) from "just failed" (upstream error).
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::NoRoute(_) => "NOT_FOUND",
            GatewayError::NoHealthyInstance(_) => "NO_HEALTHY_INSTANCE",
            GatewayError::NoCapacity(_) => "NO_CAPACITY",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamError { .. } => "UPSTREAM_ERROR",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The service the error relates to, when there is one.
    pub fn service(&self) -> Option<&str> {
        match self {
            GatewayError::NotFound(s)
            | GatewayError::NoHealthyInstance(s)
            | GatewayError::NoCapacity(s)
            | GatewayError::CircuitOpen(s)
            | GatewayError::UpstreamTimeout { service: s }
            | GatewayError::UpstreamError { service: s, .. } => Some(s),
            GatewayError::NoRoute(_)
            | GatewayError::InvalidRequest(_)
            | GatewayError::Internal(_) => None,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let err = GatewayError::NotFound("orders".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.service(), Some("orders"));
    }

    #[test]
    fn test_unavailable_family_maps_to_503() {
        let errs = [
            GatewayError::NoHealthyInstance("a".into()),
            GatewayError::NoCapacity("a".into()),
            GatewayError::CircuitOpen("a".into()),
            GatewayError::UpstreamTimeout { service: "a".into() },
            GatewayError::UpstreamError {
                service: "a".into(),
                message: "connection refused".into(),
            },
        ];
        for err in errs {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[test]
    fn test_circuit_open_is_distinct_from_upstream_error() {
        let open = GatewayError::CircuitOpen("b".into());
        let failed = GatewayError::UpstreamError {
            service: "b".into(),
            message: "reset".into(),
        };
        assert_ne!(open.code(), failed.code());
    }

    #[test]
    fn test_no_route_carries_no_service() {
        let err = GatewayError::NoRoute("/favicon.ico".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.service(), None);
    }

    #[test]
    fn test_invalid_request_maps_to_400() {
        let err = GatewayError::InvalidRequest("missing name".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.service(), None);
    }
}
