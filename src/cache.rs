use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheConfig;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded TTL key/value cache for route metadata lookups.
///
/// Readers take the lock in shared mode; writes, eviction, and the sweeper
/// take it in exclusive mode. Expired entries are never returned even before
/// the sweeper removes them. When full, insertion evicts the entry with the
/// earliest expiration (approximate LRU by expiry).
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    enabled: bool,
    default_ttl: Duration,
    cleanup_interval: Duration,
    max_size: usize,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled: config.enabled,
            default_ttl: config.ttl,
            cleanup_interval: config.cleanup_interval,
            max_size: config.max_size,
        }
    }

    /// Look up a live entry. Expired entries report a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }

        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with an explicit TTL, evicting the earliest-expiring entry
    /// when the cache is full.
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let key = key.into();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                debug!(key = %oldest, "Evicting earliest-expiring cache entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        info!("Cache cleared");
    }

    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Remove every entry whose expiration has passed.
    async fn remove_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Removed expired cache entries");
        }
    }

    /// Spawn the background sweeper. Exits when the shutdown channel fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if !cache.enabled {
                return;
            }
            let mut interval = tokio::time::interval(cache.cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => cache.remove_expired().await,
                    _ = shutdown.changed() => {
                        debug!("Cache sweeper stopped");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_size: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(1),
            max_size,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_until_expiry() {
        let cache: TtlCache<String> = TtlCache::new(&test_config(10));

        cache
            .set_with_ttl("k", "v".to_string(), Duration::from_secs(5))
            .await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_drops_earliest_expiring_entry() {
        let cache: TtlCache<u32> = TtlCache::new(&test_config(2));

        cache.set_with_ttl("short", 1, Duration::from_secs(10)).await;
        cache.set_with_ttl("long", 2, Duration::from_secs(100)).await;
        cache.set_with_ttl("new", 3, Duration::from_secs(50)).await;

        assert_eq!(cache.size().await, 2);
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some(2));
        assert_eq!(cache.get("new").await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn overwriting_existing_key_does_not_evict() {
        let cache: TtlCache<u32> = TtlCache::new(&test_config(2));

        cache.set("a", 1).await;
        cache.set("b", 2).await;
        cache.set("a", 10).await;

        assert_eq!(cache.size().await, 2);
        assert_eq!(cache.get("a").await, Some(10));
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::new(&test_config(10)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        cache.set_with_ttl("k", 1, Duration::from_millis(500)).await;
        let handle = cache.spawn_sweeper(shutdown_rx);

        // Auto-advancing sleep lets the sweeper's timer fire.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.size().await, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let mut config = test_config(10);
        config.enabled = false;
        let cache: TtlCache<u32> = TtlCache::new(&config);

        cache.set("k", 1).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let cache: TtlCache<u32> = TtlCache::new(&test_config(10));

        cache.set("a", 1).await;
        cache.set("b", 2).await;
        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.size().await, 1);

        cache.clear().await;
        assert_eq!(cache.size().await, 0);
    }
}
