use super::bucket::{TokenBucket, DEFAULT_RATE, DEFAULT_WAIT_TIMEOUT};
use crate::context::Context;
use crate::error::RateLimitError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Token buckets keyed by endpoint name.
///
/// Buckets are created on first use with the registry-wide rate and burst unless the endpoint was
/// configured explicitly through [`RateLimiterRegistry::configure`]. Lookups take a read lock;
/// creation re-checks under the write lock so concurrent first access never builds two buckets
/// for the same endpoint.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<TokenBucket>>>,
    default_rate: f64,
    default_burst: u32,
    wait_timeout: Duration,
}

impl RateLimiterRegistry {
    pub fn new(default_rate: f64, default_burst: u32, wait_timeout: Duration) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            default_rate,
            default_burst,
            wait_timeout,
        }
    }

    /// Bucket for `endpoint`, creating it with registry defaults if absent.
    pub fn limiter(&self, endpoint: &str) -> Arc<TokenBucket> {
        {
            let map = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = map.get(endpoint) {
                return existing.clone();
            }
        }

        let mut map = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(endpoint.to_string())
            .or_insert_with(|| {
                debug!(endpoint, rate = self.default_rate, "creating endpoint rate limiter");
                Arc::new(TokenBucket::new(self.default_rate, self.default_burst, self.wait_timeout))
            })
            .clone()
    }

    /// Set an explicit rate for `endpoint`, reconfiguring its bucket in place if it exists.
    pub fn configure(&self, endpoint: &str, rate: f64, burst: u32) {
        let mut map = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(endpoint) {
            Some(existing) => existing.set_rate(rate, burst),
            None => {
                map.insert(
                    endpoint.to_string(),
                    Arc::new(TokenBucket::new(rate, burst, self.wait_timeout)),
                );
            }
        }
        debug!(endpoint, rate, burst, "endpoint rate limiter configured");
    }

    /// Wait for `n` tokens on `endpoint`'s bucket.
    pub async fn wait(&self, ctx: &Context, endpoint: &str, n: u32) -> Result<(), RateLimitError> {
        self.limiter(endpoint).wait(ctx, n).await
    }

    pub fn try_acquire(&self, endpoint: &str, n: u32) -> bool {
        self.limiter(endpoint).try_acquire(n)
    }

    pub fn available(&self, endpoint: &str) -> u32 {
        self.limiter(endpoint).available()
    }

    /// Endpoints with a bucket, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let map = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, 0, DEFAULT_WAIT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_creates_with_registry_defaults() {
        let registry = RateLimiterRegistry::new(20.0, 40, Duration::from_secs(2));
        assert!(registry.endpoints().is_empty());
        let bucket = registry.limiter("zones/purge_cache");
        assert_eq!(bucket.rate(), (20.0, 40));
        assert_eq!(registry.endpoints(), vec!["zones/purge_cache".to_string()]);
    }

    #[test]
    fn repeated_lookups_share_one_bucket() {
        let registry = RateLimiterRegistry::default();
        let a = registry.limiter("kv");
        let b = registry.limiter("kv");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.limiter("purge")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_builds_a_single_bucket() {
        let registry = Arc::new(RateLimiterRegistry::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(32));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.limiter("hot")
                })
            })
            .collect();

        let buckets: Vec<_> =
            futures::future::join_all(handles).await.into_iter().map(|h| h.unwrap()).collect();
        assert!(buckets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn configure_overrides_defaults_and_updates_in_place() {
        let registry = RateLimiterRegistry::new(100.0, 200, Duration::from_secs(1));
        registry.configure("kv", 5.0, 5);
        let bucket = registry.limiter("kv");
        assert_eq!(bucket.rate(), (5.0, 5));

        registry.configure("kv", 50.0, 50);
        assert!(Arc::ptr_eq(&bucket, &registry.limiter("kv")));
        assert_eq!(bucket.rate(), (50.0, 50));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_goes_through_endpoint_bucket() {
        let registry = RateLimiterRegistry::new(10.0, 2, Duration::from_secs(1));
        let ctx = Context::new();
        registry.wait(&ctx, "purge", 2).await.unwrap();
        assert_eq!(registry.available("purge"), 0);
        assert!(!registry.try_acquire("purge", 1));
        assert_eq!(registry.available("other"), 2);
    }
}
