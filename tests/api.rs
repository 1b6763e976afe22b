//! Integration tests over the assembled router.
//!
//! The database pool is opened lazily and never connected: every endpoint
//! exercised here stays off the store, except where a store failure is the
//! behavior under test.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceExt;

use gatehouse::access_log::AccessLogger;
use gatehouse::auth::AuthService;
use gatehouse::balancer::LoadBalancer;
use gatehouse::breaker::{BreakerRegistry, BreakerSettings};
use gatehouse::cache::TtlCache;
use gatehouse::config::{
    AuthConfig, CacheConfig, Config, DatabaseConfig, GatewayConfig, LoadBalancerStrategy,
    ServerConfig, TracingConfig,
};
use gatehouse::forwarder::Forwarder;
use gatehouse::gateway::{self, AppState};
use gatehouse::rate_limit::RateLimiter;
use gatehouse::store::{Database, RequestLogRepository, RouteRepository};
use gatehouse::ws::Hub;

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            port: 8080,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            max_header_bytes: 1 << 20,
        },
        database: DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            name: "gatehouse_test".into(),
            ssl_mode: "disable".into(),
            max_open_conns: 2,
            max_idle_conns: 1,
            conn_max_lifetime: Duration::from_secs(60),
        },
        cache: CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            max_size: 100,
        },
        gateway: GatewayConfig {
            max_concurrent_requests: 100,
            request_timeout: Duration::from_secs(5),
            rate_limit_enabled: false,
            rate_limit_per_second: 100,
            backends: vec![],
            lb_strategy: LoadBalancerStrategy::RoundRobin,
        },
        auth: AuthConfig {
            enabled: false,
            jwt_secret: "integration-test-secret".into(),
            token_duration: Duration::from_secs(3600),
            admin_username: "admin".into(),
            admin_password: "password".into(),
        },
        tracing: TracingConfig {
            enabled: false,
            otel_endpoint: "localhost:4318".into(),
            service_name: "gatehouse-test".into(),
        },
    }
}

fn metrics_handle() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| gatehouse::metrics::init().expect("install recorder"))
        .clone()
}

fn app(config: Config) -> Router {
    let db = Database::connect_lazy(&config.database).expect("lazy pool");
    let (hub, _supervisor) = Hub::new();

    let state = AppState {
        routes: RouteRepository::new(db.clone()),
        request_logs: RequestLogRepository::new(db.clone()),
        db,
        cache: Arc::new(TtlCache::new(&config.cache)),
        limiter: Arc::new(RateLimiter::new(config.gateway.rate_limit_per_second)),
        breakers: Arc::new(BreakerRegistry::new(BreakerSettings::default())),
        balancer: Arc::new(LoadBalancer::new(config.gateway.lb_strategy)),
        forwarder: Arc::new(Forwarder::new(config.gateway.request_timeout).expect("forwarder")),
        hub: Arc::new(hub),
        access_log: Arc::new(AccessLogger::new(64)),
        auth: Arc::new(AuthService::new(&config.auth).expect("auth service")),
        metrics_handle: metrics_handle(),
        config: Arc::new(config),
    };
    gateway::router(state)
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let addr: SocketAddr = "10.1.2.3:55555".parse().unwrap();
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let mut req = builder.body(body).unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_feature_flags() {
    let app = app(test_config());
    let response = app
        .oneshot(request(Method::GET, "/api/status", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["features"]["websocket"], true);
    assert_eq!(body["data"]["features"]["authentication"], false);
    assert_eq!(body["data"]["websocket"]["connected_clients"], 0);
}

#[tokio::test]
async fn login_returns_bearer_token() {
    let app = app(test_config());
    let response = app
        .oneshot(request(
            Method::POST,
            "/api/auth/login",
            Some(serde_json::json!({"username": "admin", "password": "password"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["data"]["token"].as_str().unwrap().contains('.'));
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let app = app(test_config());
    let response = app
        .oneshot(request(
            Method::POST,
            "/api/auth/login",
            Some(serde_json::json!({"username": "admin", "password": "nope"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn mutations_require_token_when_auth_enabled() {
    let mut config = test_config();
    config.auth.enabled = true;
    let app = app(config);

    let response = app
        .oneshot(request(
            Method::POST,
            "/api/routes",
            Some(serde_json::json!({"path": "/x", "target_url": "http://b"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_token_passes_the_auth_gate() {
    let mut config = test_config();
    config.auth.enabled = true;
    let auth = AuthService::new(&config.auth).unwrap();
    let token = auth
        .generate_token("1", "admin", vec!["admin".to_string()])
        .unwrap();
    let app = app(config);

    // Invalid payload proves the request got past the gate into the handler.
    let mut req = request(
        Method::POST,
        "/api/routes",
        Some(serde_json::json!({"path": "no-slash", "target_url": "http://b"})),
    );
    req.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rate_limiter_returns_429_past_the_limit() {
    let mut config = test_config();
    config.gateway.rate_limit_enabled = true;
    config.gateway.rate_limit_per_second = 2;
    let app = app(config);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/status", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(request(Method::GET, "/api/status", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = app(test_config());
    let response = app
        .oneshot(request(Method::GET, "/swagger/doc.json", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["paths"]["/api/routes"]["post"].is_object());
}

#[tokio::test]
async fn metrics_exposition_is_text() {
    let app = app(test_config());
    let response = app
        .oneshot(request(Method::GET, "/metrics", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn cors_preflight_is_answered_directly() {
    let app = app(test_config());
    let mut req = request(Method::OPTIONS, "/api/routes", None);
    req.headers_mut()
        .insert(header::ORIGIN, "http://example.com".parse().unwrap());
    req.headers_mut().insert(
        header::ACCESS_CONTROL_REQUEST_METHOD,
        "POST".parse().unwrap(),
    );

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn breaker_status_starts_empty() {
    let app = app(test_config());
    let response = app
        .oneshot(request(Method::GET, "/api/circuit-breaker/status", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"], serde_json::json!({}));
}

#[tokio::test]
async fn load_balancer_status_lists_configured_backends() {
    let mut config = test_config();
    config.gateway.backends = vec!["http://b1".into(), "http://b2".into()];
    let db = Database::connect_lazy(&config.database).unwrap();
    let (hub, _supervisor) = Hub::new();

    let balancer = Arc::new(LoadBalancer::new(config.gateway.lb_strategy));
    for url in &config.gateway.backends {
        balancer.add(url.clone()).await;
    }

    let state = AppState {
        routes: RouteRepository::new(db.clone()),
        request_logs: RequestLogRepository::new(db.clone()),
        db,
        cache: Arc::new(TtlCache::new(&config.cache)),
        limiter: Arc::new(RateLimiter::new(100)),
        breakers: Arc::new(BreakerRegistry::new(BreakerSettings::default())),
        balancer,
        forwarder: Arc::new(Forwarder::new(Duration::from_secs(5)).unwrap()),
        hub: Arc::new(hub),
        access_log: Arc::new(AccessLogger::new(64)),
        auth: Arc::new(AuthService::new(&config.auth).unwrap()),
        metrics_handle: metrics_handle(),
        config: Arc::new(config),
    };

    let response = gateway::router(state)
        .oneshot(request(Method::GET, "/api/load-balancer/status", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let backends = body["data"].as_array().unwrap();
    assert_eq!(backends.len(), 2);
    assert_eq!(backends[0]["url"], "http://b1");
    assert_eq!(backends[0]["healthy"], true);
    assert_eq!(backends[0]["connections"], 0);
}
