use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::LoadBalancerStrategy;
use crate::error::{GatewayError, Result};

/// A backend server in the pool.
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    healthy: AtomicBool,
    connections: AtomicI64,
}

impl Backend {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
            connections: AtomicI64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Callers increment before dispatch and decrement after completion.
    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Status row surfaced by `/api/load-balancer/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub connections: i64,
}

/// Backend pool with pluggable selection.
pub struct LoadBalancer {
    backends: RwLock<Vec<Arc<Backend>>>,
    current: AtomicUsize,
    strategy: LoadBalancerStrategy,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancerStrategy) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            current: AtomicUsize::new(0),
            strategy,
        }
    }

    pub async fn add(&self, url: impl Into<String>) {
        let url = url.into();
        let mut backends = self.backends.write().await;
        if backends.iter().any(|b| b.url == url) {
            return;
        }
        info!(%url, "Backend added to pool");
        backends.push(Arc::new(Backend::new(url)));
    }

    pub async fn remove(&self, url: &str) {
        let mut backends = self.backends.write().await;
        backends.retain(|b| b.url != url);
    }

    pub async fn mark_healthy(&self, url: &str, healthy: bool) {
        let backends = self.backends.read().await;
        if let Some(backend) = backends.iter().find(|b| b.url == url) {
            let was = backend.healthy.swap(healthy, Ordering::Relaxed);
            if was != healthy {
                info!(%url, healthy, "Backend health changed");
            }
        }
    }

    /// Select a backend according to the configured strategy. Unhealthy
    /// backends are skipped; if every backend is unhealthy the first is
    /// returned so the caller observes a downstream error rather than a
    /// selection error.
    pub async fn select(&self) -> Result<Arc<Backend>> {
        let backends = self.backends.read().await;
        if backends.is_empty() {
            return Err(GatewayError::NoHealthyBackend);
        }

        let selected = match self.strategy {
            LoadBalancerStrategy::RoundRobin => self.round_robin(&backends),
            LoadBalancerStrategy::LeastConnections => self.least_connections(&backends),
        };

        debug!(url = %selected.url, "Backend selected");
        Ok(selected)
    }

    fn round_robin(&self, backends: &[Arc<Backend>]) -> Arc<Backend> {
        for _ in 0..backends.len() {
            let idx = self.current.fetch_add(1, Ordering::Relaxed) % backends.len();
            let backend = &backends[idx];
            if backend.is_healthy() {
                return Arc::clone(backend);
            }
        }
        Arc::clone(&backends[0])
    }

    fn least_connections(&self, backends: &[Arc<Backend>]) -> Arc<Backend> {
        backends
            .iter()
            .filter(|b| b.is_healthy())
            .min_by_key(|b| b.connections())
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&backends[0]))
    }

    pub async fn len(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn urls(&self) -> Vec<String> {
        self.backends
            .read()
            .await
            .iter()
            .map(|b| b.url.clone())
            .collect()
    }

    /// Snapshot of every backend for the status endpoint.
    pub async fn snapshot(&self) -> Vec<BackendStatus> {
        self.backends
            .read()
            .await
            .iter()
            .map(|b| BackendStatus {
                url: b.url.clone(),
                healthy: b.is_healthy(),
                connections: b.connections(),
            })
            .collect()
    }
}
