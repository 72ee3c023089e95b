//! Outbound request forwarding with header filtering and deadlines.
//!
//! Forwarding is single-shot: the forwarder never retries, so failure
//! amplification stays out of the hot path. Call outcomes feed the
//! circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{HeaderMap, Method, Response, StatusCode};

use crate::error::{GatewayError, GatewayResult};
use crate::store::{InstanceEndpoint, ServiceRegistration};

use super::breaker::BreakerRegistry;

/// Response headers added by the gateway.
pub const HEADER_GATEWAY_SERVICE: &str = "x-gateway-service";
pub const HEADER_GATEWAY_VERSION: &str = "x-gateway-service-version";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Inbound headers copied downstream; everything else is dropped so
/// internal routing metadata never leaks to backends.
const ALLOWED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "authorization",
    "accept",
    "user-agent",
    "x-request-id",
    "x-forwarded-for",
    "x-forwarded-proto",
];

/// Distributed-tracing headers pass through by prefix.
const TRACE_HEADER_PREFIXES: &[&str] = &["traceparent", "tracestate", "x-b3-", "x-trace-"];

/// Backend response headers stripped before the response leaves the
/// gateway: infrastructure details and hop-by-hop headers.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "server",
    "x-powered-by",
    "x-internal-route",
    "x-upstream-instance",
    "connection",
    "keep-alive",
    "transfer-encoding",
];

/// Whether an inbound request header may be forwarded downstream.
pub fn is_forwardable_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ALLOWED_REQUEST_HEADERS.contains(&name.as_str())
        || TRACE_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Whether a backend response header is stripped at the gateway.
pub fn is_stripped_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    STRIPPED_RESPONSE_HEADERS.contains(&name.as_str())
}

/// HTTP client for gateway-initiated calls (forwards and probes).
/// Redirect following is disabled: a 3xx answer is passed through, never
/// chased with extra downstream requests.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("failed to build HTTP client")
}

/// Builds and sends the downstream call for one routed request.
pub struct Forwarder {
    client: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
}

impl Forwarder {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        // Per-call deadlines come from each registration; the client itself
        // carries no default timeout. Redirects are never followed: a 3xx
        // from the backend passes through to the caller like any other
        // status, and each request stays a single downstream call.
        let client = build_client();
        Self { client, breakers }
    }

    /// Forwards the request to the chosen instance and returns the
    /// filtered, attributed response.
    ///
    /// On timeout or connection failure the breaker records a failure and
    /// the error carries the originating service name. Any received
    /// response (including 5xx) counts as breaker success: the backend
    /// answered.
    pub async fn forward(
        &self,
        registration: &ServiceRegistration,
        instance: &InstanceEndpoint,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        request_id: &str,
    ) -> GatewayResult<Response<Full<Bytes>>> {
        let url = format!("http://{}{}", instance.address, path_and_query);
        let outbound_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| GatewayError::Internal(format!("invalid method: {e}")))?;

        let mut outbound_headers = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            if !is_forwardable_header(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                outbound_headers.append(name, value);
            }
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(request_id) {
            outbound_headers.insert(HEADER_REQUEST_ID, value);
        }

        let deadline = Duration::from_millis(registration.call_timeout_ms);
        let result = self
            .client
            .request(outbound_method, &url)
            .headers(outbound_headers)
            .body(body)
            .timeout(deadline)
            .send()
            .await;

        match result {
            Ok(response) => {
                self.breakers.record_success(&registration.name);
                build_response(registration, response, request_id).await
            }
            Err(error) => {
                self.breakers.record_failure(&registration.name);
                tracing::warn!(
                    service = %registration.name,
                    instance = %instance.address,
                    request_id,
                    error = %error,
                    "forward failed"
                );
                if error.is_timeout() {
                    Err(GatewayError::UpstreamTimeout {
                        service: registration.name.clone(),
                    })
                } else {
                    Err(GatewayError::UpstreamError {
                        service: registration.name.clone(),
                        message: error.to_string(),
                    })
                }
            }
        }
    }
}

/// Converts the backend response: strips infrastructure headers and adds
/// gateway attribution.
async fn build_response(
    registration: &ServiceRegistration,
    response: reqwest::Response,
    request_id: &str,
) -> GatewayResult<Response<Full<Bytes>>> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| GatewayError::Internal(format!("invalid upstream status: {e}")))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if !is_stripped_header(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    builder = builder
        .header(HEADER_GATEWAY_SERVICE, &registration.name)
        .header(HEADER_GATEWAY_VERSION, &registration.version)
        .header(HEADER_REQUEST_ID, request_id);

    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamError {
            service: registration.name.clone(),
            message: format!("reading upstream body: {e}"),
        })?;

    builder
        .body(Full::new(body))
        .map_err(|e| GatewayError::Internal(format!("building response: {e}")))
}
