use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::logging::logger;
use crate::resolver::{ResolvedStream, StreamResolver};

struct CacheEntry {
    resolved: ResolvedStream,
    resolved_at: Instant,
}

/// Time-bounded cache of resolved streams, one entry per station.
///
/// Lookups re-check entry age every time; stale entries are evicted before
/// the resolver is consulted. Concurrent misses for the same station may
/// both resolve and the last writer wins — a deliberate relaxation, not a
/// single-flight guarantee.
pub struct ResolutionCache {
    resolver: Arc<dyn StreamResolver>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<dyn StreamResolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_resolve(&self, station_id: &str) -> anyhow::Result<Option<ResolvedStream>> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(station_id) {
                if entry.resolved_at.elapsed() < self.ttl {
                    return Ok(Some(entry.resolved.clone()));
                }
                entries.remove(station_id);
            }
        }

        // The map lock is never held across the resolver call.
        let resolved = self.resolver.resolve_live(station_id).await?;
        if let Some(resolved) = &resolved {
            let mut entries = self.entries.lock().await;
            entries.insert(
                station_id.to_string(),
                CacheEntry {
                    resolved: resolved.clone(),
                    resolved_at: Instant::now(),
                },
            );
            logger().info(
                "resolve.cached",
                json!({
                    "station": station_id,
                    "ttlSeconds": self.ttl.as_secs(),
                }),
            );
        }
        Ok(resolved)
    }

    pub async fn invalidate(&self, station_id: &str) {
        self.entries.lock().await.remove(station_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::logging::init_logger;

    struct CountingResolver {
        calls: AtomicUsize,
        available: bool,
    }

    impl CountingResolver {
        fn available() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                available: true,
            }
        }

        fn unavailable() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                available: false,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamResolver for CountingResolver {
        async fn resolve_live(&self, station_id: &str) -> anyhow::Result<Option<ResolvedStream>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.available {
                return Ok(None);
            }
            Ok(Some(ResolvedStream {
                station_id: station_id.to_string(),
                playlist_url: Url::parse(&format!(
                    "https://cdn.example/live/{station_id}/master.m3u8?gen={call}"
                ))
                .unwrap(),
            }))
        }
    }

    fn cache_with(resolver: Arc<CountingResolver>, ttl_secs: u64) -> ResolutionCache {
        init_logger("radiko-proxy-rs");
        ResolutionCache::new(resolver, Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_reuses_entry() {
        let resolver = Arc::new(CountingResolver::available());
        let cache = cache_with(resolver.clone(), 180);

        let first = cache.get_or_resolve("FMT").await.unwrap().unwrap();
        let second = cache.get_or_resolve("FMT").await.unwrap().unwrap();

        assert_eq!(resolver.call_count(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_triggers_fresh_resolution() {
        let resolver = Arc::new(CountingResolver::available());
        let cache = cache_with(resolver.clone(), 180);

        cache.get_or_resolve("FMT").await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(181)).await;
        cache.get_or_resolve("FMT").await.unwrap().unwrap();

        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_just_inside_ttl_is_still_valid() {
        let resolver = Arc::new(CountingResolver::available());
        let cache = cache_with(resolver.clone(), 180);

        cache.get_or_resolve("FMT").await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(179)).await;
        cache.get_or_resolve("FMT").await.unwrap().unwrap();

        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_next_lookup_to_resolve() {
        let resolver = Arc::new(CountingResolver::available());
        let cache = cache_with(resolver.clone(), 180);

        cache.get_or_resolve("FMT").await.unwrap().unwrap();
        cache.invalidate("FMT").await;
        cache.get_or_resolve("FMT").await.unwrap().unwrap();

        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test]
    async fn failed_resolution_is_not_cached() {
        let resolver = Arc::new(CountingResolver::unavailable());
        let cache = cache_with(resolver.clone(), 180);

        assert!(cache.get_or_resolve("FMT").await.unwrap().is_none());
        assert!(cache.get_or_resolve("FMT").await.unwrap().is_none());

        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test]
    async fn stations_are_cached_independently() {
        let resolver = Arc::new(CountingResolver::available());
        let cache = cache_with(resolver.clone(), 180);

        cache.get_or_resolve("FMT").await.unwrap().unwrap();
        cache.get_or_resolve("TBS").await.unwrap().unwrap();
        cache.invalidate("FMT").await;
        let kept = cache.get_or_resolve("TBS").await.unwrap().unwrap();

        assert_eq!(resolver.call_count(), 2);
        assert_eq!(kept.station_id, "TBS");
    }
}
