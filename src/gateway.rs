use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::access_log::AccessLogger;
use crate::auth::AuthService;
use crate::balancer::LoadBalancer;
use crate::breaker::BreakerRegistry;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::handlers;
use crate::middleware;
use crate::rate_limit::RateLimiter;
use crate::store::{Database, RequestLogRepository, Route, RouteRepository};
use crate::ws::Hub;

/// Value type held by the metadata cache: single routes under
/// `route:<id>` / `route:<path>:<method>`, the full listing under
/// `routes:all`.
#[derive(Debug, Clone)]
pub enum CachedRoutes {
    One(Route),
    Many(Vec<Route>),
}

/// Shared state threaded through every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub routes: RouteRepository,
    pub request_logs: RequestLogRepository,
    pub cache: Arc<TtlCache<CachedRoutes>>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub forwarder: Arc<Forwarder>,
    pub hub: Arc<Hub>,
    pub access_log: Arc<AccessLogger>,
    pub auth: Arc<AuthService>,
    pub metrics_handle: PrometheusHandle,
}

/// Assemble the full router: reserved administrative endpoints first, the
/// proxy lifecycle as the fallback, and the middleware chain
/// recovery -> CORS -> metrics -> access log -> rate limit -> timeout.
pub fn router(state: AppState) -> Router {
    let mut mutations = Router::new()
        .route("/api/routes", post(handlers::create_route))
        .route(
            "/api/routes/:id",
            put(handlers::update_route).delete(handlers::delete_route),
        );
    if state.config.auth.enabled {
        mutations = mutations.route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));
    }

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_text))
        .route("/swagger", get(handlers::swagger_index))
        .route("/swagger/doc.json", get(handlers::swagger_doc))
        .route("/swagger/*rest", get(handlers::swagger_index))
        .route("/ws", get(handlers::ws_upgrade))
        .route("/api/status", get(handlers::status))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/routes", get(handlers::list_routes))
        .route("/api/routes/:id", get(handlers::get_route))
        .route("/api/routes/:id/logs", get(handlers::route_logs))
        .route("/api/circuit-breaker/status", get(handlers::breaker_status))
        .route("/api/load-balancer/status", get(handlers::balancer_status))
        .route("/api/websocket/stats", get(handlers::websocket_stats))
        .merge(mutations)
        .fallback(handlers::proxy)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(middleware::handle_panic))
                .layer(GlobalConcurrencyLimitLayer::new(
                    state.config.gateway.max_concurrent_requests,
                ))
                .layer(cors_layer())
                .layer(from_fn(middleware::track_metrics))
                .layer(from_fn(middleware::access_log))
                .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
                .layer(from_fn_with_state(state.clone(), middleware::request_timeout)),
        )
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600))
}
