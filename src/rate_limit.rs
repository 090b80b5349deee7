use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub ip: String,
    pub bucket: i64,
}

/// Backing store for fixed-window counters. `hit` must check and increment as
/// one atomic step so concurrent requests cannot both slip under the ceiling.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Returns the new count when the key was below `limit`, `None` when it
    /// was already at or over it (in which case nothing is incremented).
    async fn hit(&self, key: &RateKey, limit: u32) -> Result<Option<u32>>;
    /// Drops counters for buckets older than `bucket`; returns how many went.
    async fn purge_before(&self, bucket: i64) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryRateStore {
    counters: Mutex<HashMap<RateKey, u32>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn hit(&self, key: &RateKey, limit: u32) -> Result<Option<u32>> {
        let mut guards = self.counters.lock().await;
        if guards.len() > MAX_RATE_LIMIT_ENTRIES {
            guards.retain(|k, _| k.bucket >= key.bucket);
        }
        let count = guards.entry(key.clone()).or_insert(0);
        if *count >= limit {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn purge_before(&self, bucket: i64) -> Result<usize> {
        let mut guards = self.counters.lock().await;
        let before = guards.len();
        guards.retain(|k, _| k.bucket >= bucket);
        Ok(before - guards.len())
    }
}

pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    limit: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, limit: u32) -> Self {
        Self { store, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn allow(&self, ip: &str) -> bool {
        self.allow_at(ip, Utc::now()).await
    }

    /// Fails open: an unavailable store lets the request through with a warning.
    pub async fn allow_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let key = RateKey {
            ip: ip.to_string(),
            bucket: minute_bucket(now),
        };
        match self.store.hit(&key, self.limit).await {
            Ok(Some(count)) => {
                debug!("Rate limit OK for {} ({}/{})", ip, count, self.limit);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Rate limit store unavailable, allowing {}: {:#}", ip, e);
                true
            }
        }
    }

    pub async fn purge_stale(&self, now: DateTime<Utc>) -> usize {
        match self.store.purge_before(minute_bucket(now)).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to purge stale rate counters: {:#}", e);
                0
            }
        }
    }
}

pub fn minute_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct BrokenStore;

    #[async_trait]
    impl RateStore for BrokenStore {
        async fn hit(&self, _key: &RateKey, _limit: u32) -> Result<Option<u32>> {
            anyhow::bail!("counter store offline")
        }
        async fn purge_before(&self, _bucket: i64) -> Result<usize> {
            anyhow::bail!("counter store offline")
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn rejects_after_ceiling_without_counting_rejections() {
        let store = Arc::new(MemoryRateStore::new());
        let limiter = RateLimiter::new(store.clone(), 3);
        let now = at(0);
        for _ in 0..3 {
            assert!(limiter.allow_at("10.0.0.1", now).await);
        }
        assert!(!limiter.allow_at("10.0.0.1", now).await);
        assert!(!limiter.allow_at("10.0.0.1", now).await);

        let key = RateKey {
            ip: "10.0.0.1".into(),
            bucket: minute_bucket(now),
        };
        assert_eq!(store.counters.lock().await.get(&key), Some(&3));
    }

    #[tokio::test]
    async fn counts_per_ip_and_resets_each_minute() {
        let limiter = RateLimiter::new(Arc::new(MemoryRateStore::new()), 1);
        let start = at(0);
        assert!(limiter.allow_at("a", start).await);
        assert!(limiter.allow_at("b", start).await);
        assert!(!limiter.allow_at("a", start + Duration::seconds(30)).await);
        assert!(limiter.allow_at("a", start + Duration::seconds(60)).await);
    }

    #[tokio::test]
    async fn fails_open_when_store_errors() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 1);
        assert!(limiter.allow_at("a", at(0)).await);
        assert!(limiter.allow_at("a", at(0)).await);
        assert_eq!(limiter.purge_stale(at(0)).await, 0);
    }

    #[tokio::test]
    async fn purges_only_past_buckets() {
        let store = Arc::new(MemoryRateStore::new());
        let limiter = RateLimiter::new(store.clone(), 5);
        assert!(limiter.allow_at("a", at(0)).await);
        assert!(limiter.allow_at("b", at(60)).await);
        assert_eq!(limiter.purge_stale(at(60)).await, 1);
        assert_eq!(store.counters.lock().await.len(), 1);
    }
}
