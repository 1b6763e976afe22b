use anyhow::Result;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access_log::AccessLogger;
use crate::auth::AuthService;
use crate::balancer::LoadBalancer;
use crate::breaker::{BreakerRegistry, BreakerSettings, BreakerState};
use crate::cache::TtlCache;
use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::gateway::{self, AppState};
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::store::{Database, RequestLogRepository, RouteRepository};
use crate::ws::{Hub, Supervisor};

const ACCESS_LOG_QUEUE_DEPTH: usize = 1024;
const STATS_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const BREAKER_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle owner: wires every component together, supervises background
/// workers, and coordinates the drain on shutdown.
pub struct Engine {
    config: Arc<Config>,
    state: AppState,
    hub_supervisor: Option<Supervisor>,
}

impl Engine {
    pub async fn new(config: Config) -> Result<Self> {
        let metrics_handle = metrics::init()?;

        let db = Database::connect(&config.database).await?;
        db.init_schema().await?;

        let cache = Arc::new(TtlCache::new(&config.cache));
        let limiter = Arc::new(RateLimiter::new(config.gateway.rate_limit_per_second));
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default()));
        let forwarder = Arc::new(Forwarder::new(config.gateway.request_timeout)?);
        let auth = Arc::new(AuthService::new(&config.auth)?);
        let access_log = Arc::new(AccessLogger::new(ACCESS_LOG_QUEUE_DEPTH));

        let balancer = Arc::new(LoadBalancer::new(config.gateway.lb_strategy));
        for url in &config.gateway.backends {
            balancer.add(url.clone()).await;
        }

        let (hub, hub_supervisor) = Hub::new();

        let config = Arc::new(config);
        let state = AppState {
            config: Arc::clone(&config),
            routes: RouteRepository::new(db.clone()),
            request_logs: RequestLogRepository::new(db.clone()),
            db,
            cache,
            limiter,
            breakers,
            balancer,
            forwarder,
            hub: Arc::new(hub),
            access_log,
            auth,
            metrics_handle,
        };

        Ok(Self {
            config,
            state,
            hub_supervisor: Some(hub_supervisor),
        })
    }

    /// Serve until SIGINT/SIGTERM, then drain: stop accepting connections,
    /// let in-flight requests finish within the grace period, stop workers,
    /// and close the store last so late log writes never hit a closed pool.
    pub async fn run(mut self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.spawn_workers(&shutdown_rx);

        let app = gateway::router(self.state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = TcpListener::bind(addr).await?;

        info!(
            %addr,
            auth = self.config.auth.enabled,
            rate_limit = self.config.gateway.rate_limit_enabled,
            tracing = self.config.tracing.enabled,
            request_timeout_secs = self.config.gateway.request_timeout.as_secs(),
            read_timeout_secs = self.config.server.read_timeout.as_secs(),
            write_timeout_secs = self.config.server.write_timeout.as_secs(),
            max_header_bytes = self.config.server.max_header_bytes,
            "Gateway listening"
        );

        let drain_tx = shutdown_tx.clone();
        let mut server = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received, draining");
                let _ = drain_tx.send(true);
            })
            .into_future(),
        );

        let mut drain_rx = shutdown_rx.clone();
        tokio::select! {
            result = &mut server => {
                result??;
            }
            _ = drain_rx.changed() => {
                let grace = self.config.server.shutdown_timeout;
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(result) => result??,
                    Err(_) => {
                        warn!(grace_secs = grace.as_secs(), "Grace period expired, aborting in-flight requests");
                        server.abort();
                    }
                }
            }
        }

        // Workers observe the same channel; make sure it fired even when the
        // server exited on its own.
        let _ = shutdown_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }

        // Requests that finished after the writer observed shutdown may have
        // queued records behind it.
        self.state
            .access_log
            .flush(&self.state.request_logs)
            .await;

        self.state.db.close().await;
        info!("Shutdown complete");
        Ok(())
    }

    fn spawn_workers(&mut self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut workers = Vec::new();

        workers.push(self.state.cache.spawn_sweeper(shutdown.clone()));
        workers.push(self.state.limiter.spawn_janitor(shutdown.clone()));
        workers.push(
            self.hub_supervisor
                .take()
                .expect("engine run twice")
                .spawn(shutdown.clone()),
        );
        workers.push(
            self.state
                .access_log
                .spawn_writer(self.state.request_logs.clone(), shutdown.clone()),
        );
        workers.push(spawn_stats_logger(self.state.clone(), shutdown.clone()));
        workers.push(spawn_health_probe(self.state.clone(), shutdown.clone()));
        workers.push(spawn_breaker_monitor(self.state.clone(), shutdown.clone()));

        info!(count = workers.len(), "Background workers started");
        workers
    }
}

/// Log a one-line operational summary every minute.
fn spawn_stats_logger(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cache_size = state.cache.size().await;
                    let backends = state.balancer.len().await;
                    debug!(
                        cache_size,
                        websocket_clients = state.hub.client_count(),
                        backends,
                        pending_access_logs = state.access_log.pending(),
                        dropped_access_logs = state.access_log.dropped(),
                        "stats"
                    );
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Probe the database and the balancer's backends. Skipped once shutdown
/// has been initiated.
fn spawn_health_probe(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_PROBE_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    if let Err(err) = state.db.health().await {
                        warn!(error = %err, "Database health check failed");
                    }
                    for url in state.balancer.urls().await {
                        let healthy = state.forwarder.probe(&url).await;
                        state.balancer.mark_healthy(&url, healthy).await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Surface breakers stuck open so operators see them without scraping.
fn spawn_breaker_monitor(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BREAKER_MONITOR_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for (target, breaker_state) in state.breakers.states() {
                        if breaker_state == BreakerState::Open {
                            warn!(target = %target, "Circuit breaker is open");
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
