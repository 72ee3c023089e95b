//! Bidirectional stream relay for upgraded connections.
//!
//! Performs the HTTP upgrade handshake against the backend, hands the 101
//! back to the client, then pumps raw bytes both ways until either side
//! closes. Closure on one side propagates to the other.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::{GatewayError, GatewayResult};
use crate::store::{InstanceEndpoint, ServiceRegistration};

use super::breaker::BreakerRegistry;
use super::forward::{HEADER_GATEWAY_SERVICE, HEADER_GATEWAY_VERSION, HEADER_REQUEST_ID};

/// Inbound headers carried through the upgrade handshake.
const UPGRADE_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "origin",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Whether an inbound header participates in the upgrade handshake.
pub fn is_upgrade_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    UPGRADE_REQUEST_HEADERS.contains(&name.as_str())
}

/// Relays upgraded connections between clients and backend instances.
pub struct StreamProxy {
    breakers: Arc<BreakerRegistry>,
}

impl StreamProxy {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self { breakers }
    }

    /// Performs the upgrade handshake against `instance` and, on a 101,
    /// spawns the byte pump between the two upgraded connections.
    ///
    /// The returned response must be delivered over a connection served
    /// `with_upgrades`, or the client-side upgrade future never resolves.
    /// A non-101 backend answer passes through unchanged so the client
    /// sees why the handshake was rejected.
    pub async fn relay(
        &self,
        registration: &ServiceRegistration,
        instance: &InstanceEndpoint,
        mut request: Request<Incoming>,
        path_and_query: &str,
        request_id: &str,
    ) -> GatewayResult<Response<Full<Bytes>>> {
        let stream = TcpStream::connect(&instance.address).await.map_err(|e| {
            self.breakers.record_failure(&registration.name);
            GatewayError::UpstreamError {
                service: registration.name.clone(),
                message: format!("connecting to {}: {e}", instance.address),
            }
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
            TokioIo::new(stream),
        )
        .await
        .map_err(|e| {
            self.breakers.record_failure(&registration.name);
            GatewayError::UpstreamError {
                service: registration.name.clone(),
                message: format!("handshake with {}: {e}", instance.address),
            }
        })?;
        tokio::spawn(async move {
            if let Err(error) = conn.with_upgrades().await {
                tracing::debug!(%error, "stream connection ended");
            }
        });

        let outbound = build_handshake_request(
            instance,
            request.headers(),
            path_and_query,
            request_id,
        )?;
        let mut backend_response = sender.send_request(outbound).await.map_err(|e| {
            self.breakers.record_failure(&registration.name);
            GatewayError::UpstreamError {
                service: registration.name.clone(),
                message: format!("upgrade request to {}: {e}", instance.address),
            }
        })?;

        self.breakers.record_success(&registration.name);

        if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!(
                service = %registration.name,
                status = %backend_response.status(),
                "backend declined upgrade"
            );
            return passthrough_response(registration, backend_response, request_id).await;
        }

        let mut client_response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in backend_response.headers() {
            if is_upgrade_header(name.as_str()) || name.as_str() == "sec-websocket-accept" {
                client_response = client_response.header(name.as_str(), value.as_bytes());
            }
        }
        client_response = client_response
            .header(HEADER_GATEWAY_SERVICE, &registration.name)
            .header(HEADER_GATEWAY_VERSION, &registration.version)
            .header(HEADER_REQUEST_ID, request_id);

        let service = registration.name.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let backend = match hyper::upgrade::on(&mut backend_response).await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::warn!(service, %error, "backend upgrade failed");
                    return;
                }
            };
            let client = match hyper::upgrade::on(&mut request).await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::warn!(service, %error, "client upgrade failed");
                    return;
                }
            };

            let mut backend = TokioIo::new(backend);
            let mut client = TokioIo::new(client);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((sent, received)) => {
                    tracing::info!(service, request_id, sent, received, "stream closed");
                }
                Err(error) => {
                    tracing::info!(service, request_id, %error, "stream aborted");
                }
            }
        });

        client_response
            .body(Full::new(Bytes::new()))
            .map_err(|e| GatewayError::Internal(format!("building response: {e}")))
    }
}

fn build_handshake_request(
    instance: &InstanceEndpoint,
    headers: &HeaderMap,
    path_and_query: &str,
    request_id: &str,
) -> GatewayResult<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header("host", &instance.address)
        .header(HEADER_REQUEST_ID, request_id);
    for (name, value) in headers {
        if is_upgrade_header(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    builder
        .body(Full::new(Bytes::new()))
        .map_err(|e| GatewayError::Internal(format!("building handshake request: {e}")))
}

/// Converts a non-101 backend answer into the client response.
async fn passthrough_response(
    registration: &ServiceRegistration,
    response: Response<Incoming>,
    request_id: &str,
) -> GatewayResult<Response<Full<Bytes>>> {
    use http_body_util::BodyExt;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| GatewayError::UpstreamError {
            service: registration.name.clone(),
            message: format!("reading upstream body: {e}"),
        })?
        .to_bytes();

    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder = builder
        .header(HEADER_GATEWAY_SERVICE, &registration.name)
        .header(HEADER_GATEWAY_VERSION, &registration.version)
        .header(HEADER_REQUEST_ID, request_id);
    builder
        .body(Full::new(body))
        .map_err(|e| GatewayError::Internal(format!("building response: {e}")))
}
