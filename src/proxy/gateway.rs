//! The gateway HTTP surface and component wiring.
//!
//! One `Gateway` owns the registry, health state, breakers, balancer,
//! forwarder, and stream relay. Instances are independent, so several can
//! coexist in one process (the tests rely on this).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthStatus, HealthStore, MonitorSet};
use crate::store::{Middleware, Registry, ServiceRegistration, ServiceStore, Tier};

use super::breaker::BreakerRegistry;
use super::forward::{build_client, Forwarder, HEADER_REQUEST_ID};
use super::router::{RequestProfile, RoutingDecision, RoutingEngine, TierHealth};
use super::stream::StreamProxy;
use super::upstream::LoadBalancer;

/// Parsed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Health,
    Services,
    AdminRegister,
    AdminUnregister(String),
    Stream {
        service: String,
        rest: String,
    },
    Api {
        service: String,
        rest: String,
    },
    NotFound,
}

/// Maps method and path to a route. Longer prefixes are tried first so
/// `/api/load-balanced/` never parses as a service named `load-balanced`.
/// Both `/api/` forms dispatch identically; the longer one is an alias.
fn parse_route(method: &Method, path: &str) -> Route {
    match (method, path) {
        (&Method::GET, "/health") => return Route::Health,
        (&Method::GET, "/services") => return Route::Services,
        (&Method::POST, "/admin/services") => return Route::AdminRegister,
        _ => {}
    }

    if method == Method::DELETE {
        if let Some(name) = path.strip_prefix("/admin/services/") {
            if !name.is_empty() && !name.contains('/') {
                return Route::AdminUnregister(name.to_string());
            }
            return Route::NotFound;
        }
    }

    if let Some(rest) = path.strip_prefix("/ws/") {
        if let Some((service, rest)) = split_service(rest) {
            return Route::Stream { service, rest };
        }
        return Route::NotFound;
    }

    if let Some(rest) = path.strip_prefix("/api/load-balanced/") {
        if let Some((service, rest)) = split_service(rest) {
            return Route::Api { service, rest };
        }
        return Route::NotFound;
    }

    if let Some(rest) = path.strip_prefix("/api/") {
        if let Some((service, rest)) = split_service(rest) {
            return Route::Api { service, rest };
        }
    }

    Route::NotFound
}

/// Splits `orders/v1/items` into `("orders", "/v1/items")`; the remainder
/// defaults to `/` so backends always see an absolute path.
fn split_service(rest: &str) -> Option<(String, String)> {
    let (service, tail) = match rest.split_once('/') {
        Some((service, tail)) => (service, format!("/{tail}")),
        None => (rest, String::new()),
    };
    if service.is_empty() {
        return None;
    }
    let tail = if tail.is_empty() { "/".to_string() } else { tail };
    Some((service.to_string(), tail))
}

/// Request gateway: tier routing, load balancing, circuit breaking, and
/// stream relay behind one HTTP listener.
pub struct Gateway {
    engine: RoutingEngine,
    registry: Registry,
    store: Arc<ServiceStore>,
    health: Arc<HealthStore>,
    balancer: Arc<LoadBalancer>,
    forwarder: Forwarder,
    streams: StreamProxy,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Wires up all components and registers the configured services.
    pub async fn new(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let store = Arc::new(ServiceStore::new());
        let health = Arc::new(HealthStore::new());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&health),
            Arc::clone(&breakers),
        ));
        let monitors = MonitorSet::new(build_client(), Arc::clone(&health));

        let gateway = Arc::new(Self {
            engine: RoutingEngine::new(config.rules, config.strategy),
            registry: Registry::new(
                Arc::clone(&store),
                Arc::clone(&health),
                Arc::clone(&breakers),
                Arc::clone(&balancer),
                monitors,
            ),
            store,
            health,
            balancer,
            forwarder: Forwarder::new(Arc::clone(&breakers)),
            streams: StreamProxy::new(breakers),
            shutdown: CancellationToken::new(),
        });

        for registration in config.services {
            gateway.registry.register(registration).await?;
        }
        Ok(gateway)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Signals the accept loop to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accepts connections until shutdown is triggered, then stops all
    /// health monitors before returning.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(%addr, "gateway listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        continue;
                    }
                },
            };

            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let gateway = Arc::clone(&gateway);
                    async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                });
                // Upgrades must be enabled or the stream relay can never
                // take over the connection.
                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!(%peer, %error, "connection ended");
                }
            });
        }
        self.registry.shutdown().await;
        tracing::info!("gateway stopped");
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match parse_route(&method, &path) {
            Route::Health => self.handle_health(),
            Route::Services => self.handle_services(),
            Route::AdminRegister => self.handle_register(req).await,
            Route::AdminUnregister(name) => self.handle_unregister(&name).await,
            Route::Stream { service, rest } => self.handle_stream(req, &service, &rest).await,
            Route::Api { service, rest } => self.handle_forward(req, &service, &rest).await,
            Route::NotFound => error_response(&GatewayError::NoRoute(path)),
        }
    }

    async fn handle_forward(
        &self,
        req: Request<Incoming>,
        service: &str,
        rest: &str,
    ) -> Response<Full<Bytes>> {
        let start = Instant::now();
        let Some(registration) = self.store.get(service) else {
            return error_response(&GatewayError::NotFound(service.to_string()));
        };

        let method = req.method().clone();
        let query = req.uri().query().map(str::to_string);
        let headers = req.headers().clone();
        let request_id = request_id_from(&headers);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                return error_response(&GatewayError::InvalidRequest(format!(
                    "reading request body: {error}"
                )))
            }
        };

        let (instance, decision) = match self.select_instance(
            &registration,
            &method,
            rest,
            query.as_deref(),
            &headers,
            body.len() as u64,
        ) {
            Ok(selected) => selected,
            Err(error) => {
                tracing::warn!(service, request_id, code = error.code(), "dispatch refused");
                return error_response(&error);
            }
        };

        if registration.has_middleware(Middleware::Logging) {
            tracing::info!(
                service,
                tier = decision.tier.as_str(),
                reason = %decision.reason,
                rule_index = ?decision.rule_index,
                instance = %instance.address,
                request_id,
                "routing decision"
            );
        } else {
            tracing::debug!(
                service,
                tier = decision.tier.as_str(),
                reason = %decision.reason,
                instance = %instance.address,
                request_id,
                "routing decision"
            );
        }

        let path_and_query = match &query {
            Some(q) => format!("{rest}?{q}"),
            None => rest.to_string(),
        };
        let result = self
            .forwarder
            .forward(
                &registration,
                &instance,
                &method,
                &path_and_query,
                &headers,
                body,
                &request_id,
            )
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(mut response) => {
                if registration.has_middleware(Middleware::Cors) {
                    add_cors_headers(response.headers_mut());
                }
                tracing::info!(
                    method = %method,
                    service,
                    tier = decision.tier.as_str(),
                    instance = %instance.address,
                    status = response.status().as_u16(),
                    elapsed_ms,
                    request_id,
                    "forwarded"
                );
                response
            }
            Err(error) => {
                tracing::info!(
                    method = %method,
                    service,
                    tier = decision.tier.as_str(),
                    instance = %instance.address,
                    code = error.code(),
                    elapsed_ms,
                    request_id,
                    "forward failed"
                );
                error_response(&error)
            }
        }
    }

    /// Picks a tier and an instance, re-deciding once to the other tier
    /// when the chosen one has no selectable instance. An open circuit is
    /// terminal: both tiers share the service's breaker, so the other
    /// tier would refuse too.
    fn select_instance(
        &self,
        registration: &ServiceRegistration,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        content_length: u64,
    ) -> GatewayResult<(crate::store::InstanceEndpoint, RoutingDecision)> {
        let profile = RequestProfile {
            method: method.clone(),
            path: path.to_string(),
            query: query.map(str::to_string),
            headers: headers.clone(),
            content_length,
        };
        let registrations = self.store.list();
        let tier_health = TierHealth {
            edge: self.health.tier_health(&registrations, Tier::Edge),
            container: self.health.tier_health(&registrations, Tier::Container),
        };
        let decision = self.engine.decide(&profile, tier_health);

        match self.balancer.pick(registration, decision.tier) {
            Ok(instance) => Ok((instance, decision)),
            Err(GatewayError::NoHealthyInstance(_)) => {
                let other = decision.tier.other();
                match self.balancer.pick(registration, other) {
                    Ok(instance) => Ok((
                        instance,
                        RoutingDecision {
                            tier: other,
                            reason: format!("failover:{}", decision.reason),
                            rule_index: decision.rule_index,
                        },
                    )),
                    Err(GatewayError::NoHealthyInstance(_)) => {
                        Err(GatewayError::NoCapacity(registration.name.clone()))
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_stream(
        &self,
        req: Request<Incoming>,
        service: &str,
        rest: &str,
    ) -> Response<Full<Bytes>> {
        let Some(registration) = self.store.get(service) else {
            return error_response(&GatewayError::NotFound(service.to_string()));
        };
        if !registration.streaming {
            // Declared surface only: a non-streaming service has no
            // stream endpoint to find.
            return error_response(&GatewayError::NotFound(service.to_string()));
        }

        let request_id = request_id_from(req.headers());
        let instance = match self.balancer.pick_any(&registration) {
            Ok(instance) => instance,
            Err(error) => return error_response(&error),
        };

        tracing::info!(
            service,
            instance = %instance.address,
            request_id,
            "stream opening"
        );
        match self
            .streams
            .relay(&registration, &instance, req, rest, &request_id)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(service, code = error.code(), request_id, "stream failed");
                error_response(&error)
            }
        }
    }

    fn handle_health(&self) -> Response<Full<Bytes>> {
        let registrations = self.store.list();
        let mut services = serde_json::Map::new();
        let mut degraded = false;

        for registration in &registrations {
            let instances: Vec<serde_json::Value> = registration
                .instances
                .iter()
                .map(|instance| {
                    let status = self.health.status(&registration.name, &instance.address);
                    if status == HealthStatus::Unhealthy {
                        degraded = true;
                    }
                    json!({
                        "address": instance.address,
                        "tier": instance.tier,
                        "status": status,
                    })
                })
                .collect();
            services.insert(
                registration.name.clone(),
                json!({
                    "version": registration.version,
                    "circuit": self.registry.breaker_state(&registration.name),
                    "instances": instances,
                }),
            );
        }

        json_response(
            StatusCode::OK,
            &json!({
                "status": if degraded { "degraded" } else { "ok" },
                "generation": self.store.generation(),
                "services": services,
            }),
        )
    }

    fn handle_services(&self) -> Response<Full<Bytes>> {
        let services: Vec<serde_json::Value> = self
            .store
            .list()
            .into_iter()
            .map(|registration| {
                let instances: Vec<serde_json::Value> = registration
                    .instances
                    .iter()
                    .map(|instance| {
                        json!({
                            "address": instance.address,
                            "tier": instance.tier,
                            "status": self.health.status(&registration.name, &instance.address),
                        })
                    })
                    .collect();
                json!({
                    "name": registration.name,
                    "version": registration.version,
                    "streaming": registration.streaming,
                    "middleware": registration.middleware,
                    "circuit": self.registry.breaker_state(&registration.name),
                    "instances": instances,
                })
            })
            .collect();

        json_response(StatusCode::OK, &json!({ "services": services }))
    }

    async fn handle_register(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                return error_response(&GatewayError::InvalidRequest(format!(
                    "reading request body: {error}"
                )))
            }
        };
        let registration: ServiceRegistration = match serde_json::from_slice(&body) {
            Ok(registration) => registration,
            Err(error) => {
                return error_response(&GatewayError::InvalidRequest(format!(
                    "parsing registration: {error}"
                )))
            }
        };

        let name = registration.name.clone();
        match self.registry.register(registration).await {
            Ok(()) => json_response(StatusCode::CREATED, &json!({ "registered": name })),
            Err(error) => error_response(&error),
        }
    }

    async fn handle_unregister(&self, name: &str) -> Response<Full<Bytes>> {
        match self.registry.unregister(name).await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "unregistered": name })),
            Err(error) => error_response(&error),
        }
    }
}

/// Echoes the inbound `x-request-id` or generates a fresh one.
fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        hyper::header::HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        hyper::header::HeaderValue::from_static("content-type, authorization, x-request-id"),
    );
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(error: &GatewayError) -> Response<Full<Bytes>> {
    let body = json!({
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "service": error.service(),
        }
    });
    json_response(error.status_code(), &body)
}
