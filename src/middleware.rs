use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::any::Any;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use crate::auth::{bearer_token, ADMIN_ROLE};
use crate::error::GatewayError;
use crate::gateway::AppState;
use crate::metrics;

/// In-flight gauge plus request counter and duration histogram.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = tokio::time::Instant::now();

    metrics::inc_in_flight();
    let response = next.run(req).await;
    metrics::dec_in_flight();

    metrics::record_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// One structured log line per request.
pub async fn access_log(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = tokio::time::Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        client = %addr,
        "request"
    );
    response
}

/// Per-client sliding-window admission. Denied requests get a 429 and never
/// reach the lifecycle handler.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.gateway.rate_limit_enabled {
        return next.run(req).await;
    }

    if !state.limiter.allow(addr.ip()) {
        metrics::record_rate_limited();
        warn!(client = %addr.ip(), "Rate limit exceeded");
        return GatewayError::RateLimited.into_response();
    }

    next.run(req).await
}

/// Cancel the request at the configured deadline. Dropping the downstream
/// future propagates cancellation to the forwarder's outbound call.
pub async fn request_timeout(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let deadline = state.config.gateway.request_timeout;
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(response) => response,
        Err(_) => GatewayError::GatewayTimeout(format!("request exceeded {:?}", deadline))
            .into_response(),
    }
}

/// Bearer-token gate for route-mutation endpoints. Validated claims are made
/// available to handlers through request extensions.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);

    let Some(token) = token else {
        return GatewayError::Unauthorized("missing authorization token".into()).into_response();
    };

    let claims = match state.auth.validate_token(token) {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };

    if !claims.has_role(ADMIN_ROLE) {
        return GatewayError::Forbidden("insufficient permissions".into()).into_response();
    }

    req.extensions_mut().insert(claims);
    next.run(req).await
}

/// Recovery boundary: a panic in any downstream handler becomes a 500 with
/// no stack leakage to the client.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> axum::http::Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = %detail, "Panic recovered in request handler");

    let body = json!({
        "success": false,
        "error": "Internal server error",
        "code": "INTERNAL_ERROR",
    });

    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            axum::http::Response::new(Body::from("internal server error"))
        })
}
