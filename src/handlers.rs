use axum::{
    extract::{ConnectInfo, Path, Query, Request, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::ADMIN_ROLE;
use crate::error::{GatewayError, Result};
use crate::gateway::{AppState, CachedRoutes};
use crate::metrics;
use crate::response;
use crate::store::{NewRoute, RequestLog, Route};
use crate::ws;

/// TTL applied by read handlers; an upper bound on read-after-write
/// staleness for entries the write path cannot enumerate.
const READ_CACHE_TTL: Duration = Duration::from_secs(120);

const ROUTES_ALL_KEY: &str = "routes:all";

fn route_id_key(id: i32) -> String {
    format!("route:{}", id)
}

fn route_match_key(path: &str, method: &str) -> String {
    format!("route:{}:{}", path, method)
}

// ---------------------------------------------------------------------------
// Health, status, observability
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Response {
    let mut status = "ok";
    let mut checks = serde_json::Map::new();

    match state.db.health().await {
        Ok(()) => {
            checks.insert("database".into(), json!("healthy"));
        }
        Err(err) => {
            warn!(error = %err, "Database health check failed");
            checks.insert("database".into(), json!("unhealthy"));
            status = "degraded";
        }
    }

    // The in-process cache has no failure mode beyond being disabled.
    checks.insert("cache".into(), json!("healthy"));

    response::success(
        "Health check completed",
        json!({ "status": status, "checks": checks }),
    )
    .into_response()
}

pub async fn status(State(state): State<AppState>) -> Response {
    let body = json!({
        "service": "gatehouse",
        "version": env!("CARGO_PKG_VERSION"),
        "features": {
            "authentication": state.config.auth.enabled,
            "tracing": state.config.tracing.enabled,
            "rate_limiting": state.config.gateway.rate_limit_enabled,
            "circuit_breaker": true,
            "load_balancing": true,
            "websocket": true,
            "metrics": true,
        },
        "cache": { "size": state.cache.size().await },
        "websocket": { "connected_clients": state.hub.client_count() },
        "load_balancer": { "backends": state.balancer.len().await },
    });
    response::success("Status retrieved", body).into_response()
}

pub async fn metrics_text(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
        .into_response()
}

pub async fn breaker_status(State(state): State<AppState>) -> Response {
    let states: serde_json::Map<String, serde_json::Value> = state
        .breakers
        .states()
        .into_iter()
        .map(|(target, breaker_state)| (target, json!(breaker_state.to_string())))
        .collect();
    response::success("Circuit breaker status", states).into_response()
}

pub async fn balancer_status(State(state): State<AppState>) -> Response {
    response::success("Load balancer status", state.balancer.snapshot().await).into_response()
}

pub async fn websocket_stats(State(state): State<AppState>) -> Response {
    response::success(
        "WebSocket stats",
        json!({ "connected_clients": state.hub.client_count() }),
    )
    .into_response()
}

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| ws::serve(hub, socket))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<LoginRequest>,
) -> Result<Response> {
    if !state.auth.verify_credentials(&credentials.username, &credentials.password) {
        warn!(username = %credentials.username, "Failed login attempt");
        return Err(GatewayError::Unauthorized("invalid credentials".into()));
    }

    let token =
        state
            .auth
            .generate_token("1", &credentials.username, vec![ADMIN_ROLE.to_string()])?;

    info!(username = %credentials.username, "Login successful");
    Ok(response::success("Login successful", json!({ "token": token })).into_response())
}

// ---------------------------------------------------------------------------
// Route CRUD
// ---------------------------------------------------------------------------

fn validate_route(payload: &NewRoute) -> Result<()> {
    if payload.path.is_empty() || !payload.path.starts_with('/') {
        return Err(GatewayError::BadRequest(
            "path must be non-empty and start with '/'".into(),
        ));
    }

    let parsed = Url::parse(&payload.target_url)
        .map_err(|_| GatewayError::BadRequest("target_url must be an absolute URL".into()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(GatewayError::BadRequest(
            "target_url must be an absolute http(s) URL".into(),
        ));
    }

    const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];
    if !METHODS.contains(&payload.method.as_str()) {
        return Err(GatewayError::BadRequest(format!(
            "unsupported method: {}",
            payload.method
        )));
    }

    if payload.rate_limit < 0 || payload.timeout_seconds < 0 {
        return Err(GatewayError::BadRequest(
            "rate_limit and timeout_seconds must be non-negative".into(),
        ));
    }

    Ok(())
}

fn normalize(mut payload: NewRoute) -> NewRoute {
    payload.method = payload.method.to_uppercase();
    payload
}

pub async fn list_routes(State(state): State<AppState>) -> Result<Response> {
    if let Some(CachedRoutes::Many(routes)) = state.cache.get(ROUTES_ALL_KEY).await {
        metrics::record_cache_hit();
        return Ok(response::success("Routes retrieved from cache", routes).into_response());
    }
    metrics::record_cache_miss();

    let routes = state.routes.list().await?;
    state
        .cache
        .set_with_ttl(ROUTES_ALL_KEY, CachedRoutes::Many(routes.clone()), READ_CACHE_TTL)
        .await;

    Ok(response::success("Routes retrieved", routes).into_response())
}

pub async fn get_route(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Response> {
    let key = route_id_key(id);
    if let Some(CachedRoutes::One(route)) = state.cache.get(&key).await {
        metrics::record_cache_hit();
        return Ok(response::success("Route retrieved from cache", route).into_response());
    }
    metrics::record_cache_miss();

    let route = state.routes.get(id).await?;
    state
        .cache
        .set_with_ttl(key, CachedRoutes::One(route.clone()), READ_CACHE_TTL)
        .await;

    Ok(response::success("Route retrieved", route).into_response())
}

pub async fn create_route(
    State(state): State<AppState>,
    Json(payload): Json<NewRoute>,
) -> Result<Response> {
    let payload = normalize(payload);
    validate_route(&payload)?;

    let route = state.routes.create(&payload).await?;

    // Invalidate before the response leaves the handler.
    state.cache.delete(ROUTES_ALL_KEY).await;
    state.cache.delete(&route_id_key(route.id)).await;
    state
        .cache
        .delete(&route_match_key(&route.path, &route.method))
        .await;

    info!(id = route.id, path = %route.path, target = %route.target_url, "Route created");
    Ok(response::created("Route created successfully", route).into_response())
}

pub async fn update_route(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(payload): Json<NewRoute>,
) -> Result<Response> {
    let payload = normalize(payload);
    validate_route(&payload)?;

    let previous = state.routes.get(id).await?;
    let route = state.routes.update(id, &payload).await?;

    state.cache.delete(ROUTES_ALL_KEY).await;
    state.cache.delete(&route_id_key(id)).await;
    state
        .cache
        .delete(&route_match_key(&previous.path, &previous.method))
        .await;
    state
        .cache
        .delete(&route_match_key(&route.path, &route.method))
        .await;

    info!(id, path = %route.path, "Route updated");
    Ok(response::success("Route updated successfully", route).into_response())
}

pub async fn delete_route(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Response> {
    let previous = state.routes.get(id).await?;
    state.routes.delete(id).await?;

    state.cache.delete(ROUTES_ALL_KEY).await;
    state.cache.delete(&route_id_key(id)).await;
    state
        .cache
        .delete(&route_match_key(&previous.path, &previous.method))
        .await;

    info!(id, "Route deleted");
    Ok(response::success("Route deleted successfully", ()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<i64>,
}

pub async fn route_logs(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    // 404 for unknown routes rather than an empty page.
    state.routes.get(id).await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let logs = state.request_logs.for_route(id, limit).await?;
    Ok(response::success("Request logs retrieved", logs).into_response())
}

// ---------------------------------------------------------------------------
// Proxy lifecycle
// ---------------------------------------------------------------------------

/// The fallback handler: everything that is not a reserved administrative
/// endpoint is resolved against the route table and proxied.
pub async fn proxy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let start = tokio::time::Instant::now();
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let client_ip = addr.ip().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let route = match resolve_route(&state, &path, &method).await {
        Ok(resolution) => match resolution {
            Resolution::Enabled(route) => route,
            Resolution::Disabled(route_id) => {
                let resp = response::error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Route is disabled",
                )
                .into_response();
                submit_access_log(
                    &state, Some(route_id), &method, &path, resp.status(), start, &client_ip,
                    &user_agent,
                );
                return resp;
            }
            Resolution::NotFound => {
                debug!(%method, %path, "No route found");
                let resp =
                    response::error(StatusCode::NOT_FOUND, "Route not found").into_response();
                submit_access_log(
                    &state, None, &method, &path, resp.status(), start, &client_ip, &user_agent,
                );
                return resp;
            }
        },
        Err(err) => {
            error!(error = %err, %method, %path, "Route resolution failed");
            let resp = GatewayError::Internal("failed to resolve route".into()).into_response();
            submit_access_log(
                &state, None, &method, &path, resp.status(), start, &client_ip, &user_agent,
            );
            return resp;
        }
    };

    let target = route.target_url.clone();
    let timeout = state.forwarder.effective_timeout(route.timeout_seconds);

    let breaker = state.breakers.get(&target);
    let guard = match breaker.try_acquire() {
        Ok(guard) => guard,
        Err(err) => {
            warn!(target = %target, "Circuit breaker rejected request");
            metrics::record_proxy_error(&target, "circuit_breaker");
            let resp = err.into_response();
            submit_access_log(
                &state,
                Some(route.id),
                &method,
                &path,
                resp.status(),
                start,
                &client_ip,
                &user_agent,
            );
            return resp;
        }
    };

    let response = match state.forwarder.forward(&target, req, addr, timeout).await {
        Ok(response) => {
            // An upstream 5xx counts against the breaker but is still
            // relayed to the client as-is.
            if response.status().is_server_error() {
                guard.failure();
            } else {
                guard.success();
            }
            response
        }
        Err(err) => {
            guard.failure();
            error!(target = %target, error = %err, "Proxy error");
            metrics::record_proxy_error(&target, "transport");
            GatewayError::ServiceUnavailable("Service temporarily unavailable".into())
                .into_response()
        }
    };

    submit_access_log(
        &state,
        Some(route.id),
        &method,
        &path,
        response.status(),
        start,
        &client_ip,
        &user_agent,
    );
    response
}

enum Resolution {
    Enabled(Route),
    Disabled(i32),
    NotFound,
}

/// Cache-aside route lookup keyed by `route:<path>:<method>`. Only enabled
/// routes are cached; disabled ones are re-checked on every request.
async fn resolve_route(state: &AppState, path: &str, method: &str) -> Result<Resolution> {
    let key = route_match_key(path, method);
    if let Some(CachedRoutes::One(route)) = state.cache.get(&key).await {
        metrics::record_cache_hit();
        return Ok(Resolution::Enabled(route));
    }
    metrics::record_cache_miss();

    if let Some(route) = state.routes.find(path, method).await? {
        state
            .cache
            .set_with_ttl(key, CachedRoutes::One(route.clone()), READ_CACHE_TTL)
            .await;
        return Ok(Resolution::Enabled(route));
    }

    match state.routes.find_any(path, method).await? {
        Some(disabled) => Ok(Resolution::Disabled(disabled.id)),
        None => Ok(Resolution::NotFound),
    }
}

/// Fire-and-forget: the queue submission is synchronous and bounded, and the
/// background writer owns persistence. Failures never reach the client.
#[allow(clippy::too_many_arguments)]
fn submit_access_log(
    state: &AppState,
    route_id: Option<i32>,
    method: &str,
    path: &str,
    status: StatusCode,
    start: tokio::time::Instant,
    client_ip: &str,
    user_agent: &str,
) {
    state.access_log.submit(RequestLog::new(
        route_id,
        method,
        path,
        status.as_u16(),
        start.elapsed().as_millis(),
        client_ip,
        user_agent,
    ));
}

// ---------------------------------------------------------------------------
// OpenAPI surface
// ---------------------------------------------------------------------------

pub async fn swagger_index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Gatehouse API</title></head>
<body>
  <h1>Gatehouse API</h1>
  <p>The OpenAPI description is served at <a href="/swagger/doc.json">/swagger/doc.json</a>.</p>
</body>
</html>"#,
    )
}

pub async fn swagger_doc() -> Json<serde_json::Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Gatehouse API Gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Administrative surface of the gatehouse reverse proxy"
        },
        "paths": {
            "/health": { "get": { "summary": "Health check" } },
            "/metrics": { "get": { "summary": "Prometheus metrics" } },
            "/ws": { "get": { "summary": "WebSocket upgrade" } },
            "/api/status": { "get": { "summary": "Gateway status and feature flags" } },
            "/api/auth/login": { "post": { "summary": "Exchange credentials for a bearer token" } },
            "/api/routes": {
                "get": { "summary": "List routes" },
                "post": { "summary": "Create a route" }
            },
            "/api/routes/{id}": {
                "get": { "summary": "Get a route" },
                "put": { "summary": "Update a route" },
                "delete": { "summary": "Delete a route" }
            },
            "/api/routes/{id}/logs": { "get": { "summary": "Recent access logs for a route" } },
            "/api/circuit-breaker/status": { "get": { "summary": "Breaker state per target" } },
            "/api/load-balancer/status": { "get": { "summary": "Backend pool status" } },
            "/api/websocket/stats": { "get": { "summary": "Connected WebSocket clients" } }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, target: &str, method: &str) -> NewRoute {
        serde_json::from_value(json!({
            "path": path,
            "target_url": target,
            "method": method,
        }))
        .unwrap()
    }

    #[test]
    fn validates_well_formed_route() {
        let route = normalize(payload("/api/users", "http://backend:8080/users", "get"));
        assert_eq!(route.method, "GET");
        assert!(validate_route(&route).is_ok());
    }

    #[test]
    fn rejects_relative_target_url() {
        let route = payload("/api/users", "backend/users", "GET");
        assert!(matches!(
            validate_route(&route),
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let route = payload("/api/users", "ftp://backend/users", "GET");
        assert!(validate_route(&route).is_err());
    }

    #[test]
    fn rejects_bad_path_and_method() {
        assert!(validate_route(&payload("api/users", "http://b", "GET")).is_err());
        assert!(validate_route(&normalize(payload("/x", "http://b", "FETCH"))).is_err());
    }

    #[test]
    fn cache_keys_are_stable() {
        assert_eq!(route_id_key(7), "route:7");
        assert_eq!(route_match_key("/api/users", "GET"), "route:/api/users:GET");
    }
}
