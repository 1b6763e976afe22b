use dashmap::DashMap;
use metrics::gauge;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Testing recovery with a bounded number of probes.
    HalfOpen,
    /// Target assumed down, calls fail fast.
    Open,
}

impl BreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::HalfOpen => write!(f, "half-open"),
            BreakerState::Open => write!(f, "open"),
        }
    }
}

/// Tunables for a single breaker.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Probe budget in half-open, and the consecutive successes required to close.
    pub max_requests: u32,
    /// Rolling counting interval while closed.
    pub interval: Duration,
    /// How long an open breaker stays open before probing.
    pub open_timeout: Duration,
    /// Minimum requests in the interval before the ratio is evaluated.
    pub min_requests: u32,
    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u32,
    failures: u32,
    consecutive_successes: u32,
}

struct Inner {
    state: BreakerState,
    /// Bumped on every state transition and interval roll; results from a
    /// previous generation are discarded.
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Per-target failure detector.
///
/// The mutex is held only for bookkeeping around a call, never across the
/// protected call itself, so probe-gate admission is strictly serialized
/// while calls run concurrently.
pub struct CircuitBreaker {
    target: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(target: String, settings: BreakerSettings) -> Self {
        Self {
            target,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        }
    }

    /// Roll expired intervals and promote an expired Open breaker to HalfOpen.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        inner.generation += 1;
                        inner.counts = Counts::default();
                        inner.expiry = Some(now + self.settings.interval);
                    }
                }
            }
            BreakerState::Open => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        self.transition(inner, BreakerState::HalfOpen, now);
                    }
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match to {
            BreakerState::Closed => Some(now + self.settings.interval),
            BreakerState::Open => Some(now + self.settings.open_timeout),
            BreakerState::HalfOpen => None,
        };

        gauge!("gateway_circuit_breaker_state", "target" => self.target.clone())
            .set(to.gauge_value());
        if to == BreakerState::Open {
            warn!(target = %self.target, %from, %to, "Circuit breaker state changed");
        } else {
            info!(target = %self.target, %from, %to, "Circuit breaker state changed");
        }
    }

    /// Admit a call, returning a guard that must record the outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallGuard> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Open => return Err(GatewayError::BreakerOpen(self.target.clone())),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                return Err(GatewayError::BreakerOpen(self.target.clone()));
            }
            _ => {}
        }

        if inner.state == BreakerState::Closed && inner.expiry.is_none() {
            inner.expiry = Some(now + self.settings.interval);
        }
        inner.counts.requests += 1;

        Ok(CallGuard {
            breaker: Arc::clone(self),
            generation: inner.generation,
            recorded: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        inner.counts.consecutive_successes += 1;
        if inner.state == BreakerState::HalfOpen
            && inner.counts.consecutive_successes >= self.settings.max_requests
        {
            self.transition(&mut inner, BreakerState::Closed, now);
        }
    }

    fn on_failure(&self, generation: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        inner.counts.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.counts.failures += 1;
                let counts = inner.counts;
                if counts.requests >= self.settings.min_requests
                    && f64::from(counts.failures) / f64::from(counts.requests)
                        >= self.settings.failure_ratio
                {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::Open => {}
        }
    }

    /// Read-only observation of the current state.
    pub fn state(&self) -> BreakerState {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, now);
        inner.state
    }
}

/// Outcome recorder for one admitted call. Dropping the guard without
/// recording (a cancelled call) counts as a failure.
pub struct CallGuard {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    recorded: bool,
}

impl CallGuard {
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.on_failure(self.generation);
        }
    }
}

/// Registry of circuit breakers keyed by target URL. Breakers are created
/// lazily on first use and live for the process lifetime.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for a target.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return Arc::clone(&breaker);
        }

        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target.to_string(),
                    self.settings.clone(),
                ))
            })
            .clone()
    }

    /// Execute `f` under the target's breaker. An `Err` from `f` is recorded
    /// as a failure; while the breaker is open, `f` is never invoked.
    pub async fn execute<T, F, Fut>(&self, target: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get(target);
        let guard = breaker.try_acquire()?;
        match f().await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(err) => {
                guard.failure();
                Err(err)
            }
        }
    }

    /// Current state of one target's breaker. Targets with no breaker yet
    /// report closed.
    pub fn state(&self, target: &str) -> BreakerState {
        self.breakers
            .get(target)
            .map(|breaker| breaker.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// States of every known breaker.
    pub fn states(&self) -> HashMap<String, BreakerState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}
