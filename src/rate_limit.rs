use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Per-client sliding-window rate limiter keyed by remote IP.
///
/// Each client keeps the timestamps of its requests inside the window;
/// timestamps at or before `now - window` are pruned on every admission
/// decision. A janitor removes empty sequences once a minute.
pub struct RateLimiter {
    windows: DashMap<IpAddr, Vec<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window: Duration::from_secs(1),
        }
    }

    /// Decide whether a request from `client` is admitted.
    pub fn allow(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;

        let mut times = self.windows.entry(client).or_default();
        times.retain(|t| *t > cutoff);

        if times.len() >= self.limit {
            return false;
        }

        times.push(now);
        true
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drop sequences that have gone fully idle.
    fn remove_idle(&self) {
        let cutoff = Instant::now() - self.window;
        let before = self.windows.len();
        self.windows.retain(|_, times| {
            times.retain(|t| *t > cutoff);
            !times.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Rate limiter janitor dropped idle clients");
        }
    }

    /// Spawn the janitor. Exits when the shutdown channel fires.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.remove_idle(),
                    _ = shutdown.changed() => {
                        debug!("Rate limiter janitor stopped");
                        return;
                    }
                }
            }
        })
    }
}
