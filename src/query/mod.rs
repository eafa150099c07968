//! Statistics read path
//!
//! Each subject's lookup tries, in order: a cached snapshot, the stored rollup,
//! then live aggregation over the transactional tables. Whatever the rollup or
//! live path produces is written back as a snapshot on a best-effort basis.

mod plan;
mod questionnaire;
mod system;
mod testee;

pub(crate) use system::local_midnight;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CounterCache;
use crate::db::{RawAggregator, RollupStore};
use crate::error::{Result, StatsError};

/// Days covered by the trend series returned with questionnaire and system views.
pub const TREND_DAYS: u32 = 30;

/// Run a store call, giving up as soon as `cancel` fires.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(StatsError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StatsError::Cancelled),
        res = fut => res,
    }
}

#[derive(Clone)]
pub struct QueryGateway {
    cache: Arc<dyn CounterCache>,
    rollups: Arc<dyn RollupStore>,
    raw: RawAggregator,
    snapshot_ttl: Duration,
}

impl QueryGateway {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        rollups: Arc<dyn RollupStore>,
        raw: RawAggregator,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            rollups,
            raw,
            snapshot_ttl,
        }
    }

    /// Cached view for `key`. Read failures and undecodable payloads are misses.
    async fn lookup_snapshot<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<Option<T>> {
        let payload = match cancellable(cancel, self.cache.get_snapshot(key)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(StatsError::Cancelled) => return Err(StatsError::Cancelled),
            Err(e) => {
                warn!(key, error = %e, "Snapshot read failed, treating as miss");
                return Ok(None);
            }
        };
        match serde_json::from_str(&payload) {
            Ok(view) => {
                debug!(key, "Snapshot hit");
                Ok(Some(view))
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable snapshot");
                Ok(None)
            }
        }
    }

    /// Write `view` back to the cache. The outcome is logged and never returned;
    /// callers must not rely on the snapshot existing afterwards.
    async fn store_snapshot<T: Serialize>(&self, key: &str, view: &T) {
        let payload = match serde_json::to_string(view) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize snapshot");
                return;
            }
        };
        match self.cache.set_snapshot(key, payload, self.snapshot_ttl).await {
            Ok(()) => debug!(key, ttl_secs = self.snapshot_ttl.as_secs(), "Snapshot stored"),
            Err(e) => warn!(key, error = %e, "Failed to store snapshot"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::cache::{CounterCache, CounterTotals, DailyCounter, MemoryCounterCache};
    use crate::db::{Database, RawAggregator, RollupStore, SqliteRollupStore};
    use crate::error::{Result, StatsError};
    use crate::model::{
        AccumulatedStatistics, DailyStatistics, Distribution, PlanRollup, StatKey,
    };

    use super::QueryGateway;

    /// Rollup store that counts reads before delegating to SQLite.
    pub struct CountingRollupStore {
        inner: SqliteRollupStore,
        pub reads: AtomicUsize,
    }

    impl CountingRollupStore {
        pub fn new(inner: SqliteRollupStore) -> Self {
            Self {
                inner,
                reads: AtomicUsize::new(0),
            }
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RollupStore for CountingRollupStore {
        async fn get_accumulated(&self, key: &StatKey) -> Result<Option<AccumulatedStatistics>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_accumulated(key).await
        }

        async fn upsert_accumulated(&self, stats: &AccumulatedStatistics) -> Result<()> {
            self.inner.upsert_accumulated(stats).await
        }

        async fn upsert_daily(&self, row: &DailyStatistics) -> Result<()> {
            self.inner.upsert_daily(row).await
        }

        async fn get_daily_range(
            &self,
            key: &StatKey,
            from: NaiveDate,
            to: NaiveDate,
        ) -> Result<Vec<DailyStatistics>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_daily_range(key, from, to).await
        }

        async fn fold_daily_into_accumulated(
            &self,
            key: &StatKey,
            distribution: Option<Distribution>,
        ) -> Result<Option<AccumulatedStatistics>> {
            self.inner.fold_daily_into_accumulated(key, distribution).await
        }

        async fn get_plan(&self, org_id: i64, plan_id: i64) -> Result<Option<PlanRollup>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_plan(org_id, plan_id).await
        }

        async fn upsert_plan(&self, rollup: &PlanRollup) -> Result<()> {
            self.inner.upsert_plan(rollup).await
        }
    }

    /// Cache whose snapshot writes always fail.
    pub struct ReadOnlyCache(pub MemoryCounterCache);

    #[async_trait]
    impl CounterCache for ReadOnlyCache {
        async fn scan_daily_counters(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.scan_daily_counters(prefix).await
        }

        async fn get_daily_counter(&self, key: &str) -> Result<Option<DailyCounter>> {
            self.0.get_daily_counter(key).await
        }

        async fn get_accumulated_counter(&self, key: &str) -> Result<Option<CounterTotals>> {
            self.0.get_accumulated_counter(key).await
        }

        async fn get_snapshot(&self, key: &str) -> Result<Option<String>> {
            self.0.get_snapshot(key).await
        }

        async fn set_snapshot(&self, _key: &str, _payload: String, _ttl: Duration) -> Result<()> {
            Err(StatsError::Cache("cache is read-only".to_string()))
        }

        async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.0.try_lock(key, token, ttl).await
        }

        async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
            self.0.unlock(key, token).await
        }
    }

    pub struct Harness {
        pub db: Database,
        pub cache: Arc<MemoryCounterCache>,
        pub rollups: Arc<CountingRollupStore>,
        pub gateway: QueryGateway,
    }

    pub async fn harness() -> Harness {
        let db = crate::db::testing::test_database().await;
        let cache = Arc::new(MemoryCounterCache::new(Duration::from_secs(300)));
        let rollups = Arc::new(CountingRollupStore::new(SqliteRollupStore::new(
            db.pool().clone(),
        )));
        let gateway = QueryGateway::new(
            cache.clone(),
            rollups.clone(),
            RawAggregator::new(db.pool().clone()),
            Duration::from_secs(300),
        );
        Harness {
            db,
            cache,
            rollups,
            gateway,
        }
    }
}
