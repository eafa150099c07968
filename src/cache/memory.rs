//! In-process counter cache
//!
//! Snapshots live in a `TimedCache` sized to the configured snapshot lifespan;
//! each entry also carries its own deadline so shorter TTLs are honoured.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CounterCache, CounterTotals, DailyCounter};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Expiring<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Expiring<V> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

pub struct MemoryCounterCache {
    daily: Mutex<BTreeMap<String, Expiring<DailyCounter>>>,
    accumulated: Mutex<HashMap<String, CounterTotals>>,
    snapshots: Mutex<TimedCache<String, Expiring<String>>>,
    locks: Mutex<HashMap<String, Expiring<String>>>,
}

impl MemoryCounterCache {
    /// `snapshot_lifespan` bounds every snapshot regardless of the TTL it was set with.
    pub fn new(snapshot_lifespan: Duration) -> Self {
        Self {
            daily: Mutex::new(BTreeMap::new()),
            accumulated: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(TimedCache::with_lifespan(snapshot_lifespan.as_secs().max(1))),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Write-path increment of a daily counter. A `ttl` refreshes the counter's expiry.
    pub async fn incr_daily_counter(
        &self,
        key: &str,
        submissions: i64,
        completions: i64,
        ttl: Option<Duration>,
    ) {
        let mut daily = self.daily.lock().await;
        let entry = daily.entry(key.to_string()).or_insert(Expiring {
            value: DailyCounter::default(),
            expires_at: None,
        });
        entry.value.submission_count += submissions;
        entry.value.completion_count += completions;
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    /// Write-path overwrite of a daily counter.
    pub async fn set_daily_counter(&self, key: &str, counter: DailyCounter) {
        self.daily.lock().await.insert(
            key.to_string(),
            Expiring {
                value: counter,
                expires_at: None,
            },
        );
    }

    /// Insert a raw key without validation, as a misbehaving writer might.
    #[cfg(test)]
    pub(crate) async fn set_raw_daily_counter(&self, key: &str) {
        self.set_daily_counter(key, DailyCounter::default()).await;
    }

    pub async fn set_accumulated_counter(&self, key: &str, totals: CounterTotals) {
        self.accumulated.lock().await.insert(key.to_string(), totals);
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn scan_daily_counters(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut daily = self.daily.lock().await;
        daily.retain(|_, entry| entry.live(now));
        Ok(daily
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn get_daily_counter(&self, key: &str) -> Result<Option<DailyCounter>> {
        let now = Instant::now();
        let daily = self.daily.lock().await;
        Ok(daily
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value))
    }

    async fn get_accumulated_counter(&self, key: &str) -> Result<Option<CounterTotals>> {
        Ok(self.accumulated.lock().await.get(key).copied())
    }

    async fn get_snapshot(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut snapshots = self.snapshots.lock().await;
        let key = key.to_string();
        let hit = match snapshots.cache_get(&key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            debug!(key = %key, "Evicting expired snapshot");
            snapshots.cache_remove(&key);
        }
        Ok(hit)
    }

    async fn set_snapshot(&self, key: &str, payload: String, ttl: Duration) -> Result<()> {
        self.snapshots.lock().await.cache_set(
            key.to_string(),
            Expiring {
                value: payload,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|held| held.live(now)) {
            return Ok(false);
        }
        locks.insert(
            key.to_string(),
            Expiring {
                value: token.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(held) if held.value == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_returns_only_matching_prefix() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        cache.incr_daily_counter("stats:daily:1:questionnaire:Q1:2026-01-01", 1, 0, None).await;
        cache.incr_daily_counter("stats:daily:1:questionnaire:Q2:2026-01-01", 1, 1, None).await;
        cache.incr_daily_counter("stats:daily:1:testee:3:2026-01-01", 1, 0, None).await;
        cache.incr_daily_counter("stats:daily:2:questionnaire:Q1:2026-01-01", 1, 0, None).await;

        let keys = cache.scan_daily_counters("stats:daily:1:questionnaire:").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "stats:daily:1:questionnaire:Q1:2026-01-01".to_string(),
                "stats:daily:1:questionnaire:Q2:2026-01-01".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn increments_accumulate() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        let key = "stats:daily:1:questionnaire:Q1:2026-01-01";
        cache.incr_daily_counter(key, 2, 1, None).await;
        cache.incr_daily_counter(key, 3, 1, None).await;
        assert_eq!(
            cache.get_daily_counter(key).await.unwrap(),
            Some(DailyCounter {
                submission_count: 5,
                completion_count: 2
            })
        );
    }

    #[tokio::test]
    async fn expired_counters_disappear_from_scans() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        let key = "stats:daily:1:testee:3:2026-01-01";
        cache.incr_daily_counter(key, 1, 0, Some(Duration::ZERO)).await;
        assert!(cache.get_daily_counter(key).await.unwrap().is_none());
        assert!(cache.scan_daily_counters("stats:daily:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_honours_entry_ttl() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        cache
            .set_snapshot("system:1", "{}".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(cache.get_snapshot("system:1").await.unwrap().as_deref(), Some("{}"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get_snapshot("system:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_by_owner() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        let ttl = Duration::from_secs(60);
        assert!(cache.try_lock("stats:lock:a", "t1", ttl).await.unwrap());
        assert!(!cache.try_lock("stats:lock:a", "t2", ttl).await.unwrap());
        assert!(!cache.unlock("stats:lock:a", "t2").await.unwrap());
        assert!(cache.unlock("stats:lock:a", "t1").await.unwrap());
        assert!(cache.try_lock("stats:lock:a", "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let cache = MemoryCounterCache::new(Duration::from_secs(300));
        assert!(cache.try_lock("stats:lock:a", "t1", Duration::ZERO).await.unwrap());
        assert!(cache.try_lock("stats:lock:a", "t2", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.unlock("stats:lock:a", "t1").await.unwrap());
    }
}
