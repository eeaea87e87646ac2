//! Request logging. One line per request, with WebSocket upgrades called out
//! and health probes demoted to debug.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info};

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let remote_addr = req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string();
        let upgrade = is_websocket_upgrade(&req);
        let quiet = is_probe(req.path());

        if upgrade {
            info!(method = %method, uri = %uri, remote_addr = %remote_addr, "WebSocket upgrade requested");
        } else if quiet {
            debug!(method = %method, uri = %uri, "Probe request");
        } else {
            info!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &result {
                Ok(response) if quiet => debug!(
                    uri = %uri,
                    status = response.status().as_u16(),
                    duration_ms,
                    "Probe completed"
                ),
                Ok(response) => info!(
                    method = %method,
                    uri = %uri,
                    remote_addr = %remote_addr,
                    status = response.status().as_u16(),
                    upgrade,
                    duration_ms,
                    "Request completed"
                ),
                Err(err) => error!(
                    method = %method,
                    uri = %uri,
                    remote_addr = %remote_addr,
                    duration_ms,
                    error = %err,
                    "Request failed"
                ),
            }

            result
        })
    }
}

fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Health probes hit the server constantly; keep them out of info logs.
fn is_probe(path: &str) -> bool {
    matches!(path, "/health" | "/api/v1/health")
}
