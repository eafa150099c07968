//! Batch jobs promoting counters into rollups and reconciling the two
//!
//! Jobs walk organizations, stat types and subjects one at a time. A failing
//! item is logged and counted; only a failing scan or enumeration aborts a run.

mod scheduler;
mod sync;
mod validate;

pub use scheduler::{run_cycle, start_background_tasks};
pub use sync::Synchronizer;
pub use validate::Validator;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{
    all_daily_counters_prefix, daily_counter_prefix, lock_key, parse_daily_counter_key,
    CounterCache,
};
use crate::config::SchedulerConfig;
use crate::db::RawAggregator;
use crate::error::Result;
use crate::model::{StatKey, StatType};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub tracked_stat_types: Vec<StatType>,
    pub use_lock: bool,
    pub lock_ttl: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        SchedulerConfig::default().into()
    }
}

impl From<SchedulerConfig> for BatchOptions {
    fn from(config: SchedulerConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            tracked_stat_types: config.tracked_stat_types,
            use_lock: config.use_lock,
        }
    }
}

/// Outcome of a batch run that may have deferred to a concurrent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<R> {
    Completed(R),
    /// Another run held the job lock; nothing was done.
    Locked,
}

impl<R> RunOutcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            RunOutcome::Completed(report) => Some(report),
            RunOutcome::Locked => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub consistent: usize,
    pub repaired: usize,
    /// Subjects with counters but no rollup yet.
    pub missing: usize,
    pub failed: usize,
}

/// Run `job` while holding the cache lock named after `name`.
///
/// The lock is released only if this run still owns it. Returns
/// [`RunOutcome::Locked`] without polling `job` when another run holds it.
pub(crate) async fn with_lock<R>(
    cache: &dyn CounterCache,
    options: &BatchOptions,
    name: &str,
    job: impl Future<Output = Result<R>>,
) -> Result<RunOutcome<R>> {
    if !options.use_lock {
        return job.await.map(RunOutcome::Completed);
    }

    let key = lock_key(name);
    let token = uuid::Uuid::new_v4().to_string();
    if !cache.try_lock(&key, &token, options.lock_ttl).await? {
        info!(job = name, "Another run holds the lock, skipping");
        return Ok(RunOutcome::Locked);
    }

    let result = job.await;
    match cache.unlock(&key, &token).await {
        Ok(true) => debug!(job = name, "Lock released"),
        Ok(false) => warn!(job = name, "Lock expired before the run finished"),
        Err(e) => warn!(job = name, error = %e, "Failed to release lock"),
    }
    result.map(RunOutcome::Completed)
}

/// One well-formed daily counter found by a scan.
#[derive(Debug, Clone)]
pub(crate) struct ScannedCounter {
    pub raw_key: String,
    pub key: StatKey,
    pub date: NaiveDate,
}

/// Daily counters of one organization and stat type. Malformed keys are
/// logged and returned as a count.
pub(crate) async fn scan_counters(
    cache: &dyn CounterCache,
    org_id: i64,
    stat_type: StatType,
) -> Result<(Vec<ScannedCounter>, usize)> {
    let prefix = daily_counter_prefix(org_id, stat_type);
    let raw_keys = cache.scan_daily_counters(&prefix).await?;

    let mut counters = Vec::with_capacity(raw_keys.len());
    let mut malformed = 0;
    for raw_key in raw_keys {
        match parse_daily_counter_key(&raw_key) {
            Ok((key, date)) => counters.push(ScannedCounter { raw_key, key, date }),
            Err(e) => {
                warn!(key = %raw_key, error = %e, "Skipping malformed counter key");
                malformed += 1;
            }
        }
    }
    debug!(org_id, %stat_type, found = counters.len(), malformed, "Scanned counters");
    Ok((counters, malformed))
}

/// Organizations to process: every org with live source records plus every
/// org that has counters waiting to be promoted.
pub(crate) async fn discover_orgs(cache: &dyn CounterCache, raw: &RawAggregator) -> Result<Vec<i64>> {
    let mut orgs: BTreeSet<i64> = raw.list_active_orgs().await?.into_iter().collect();
    for raw_key in cache.scan_daily_counters(&all_daily_counters_prefix()).await? {
        if let Ok((key, _)) = parse_daily_counter_key(&raw_key) {
            orgs.insert(key.org_id);
        }
    }
    Ok(orgs.into_iter().collect())
}

/// Stores and caches that fail on chosen keys, for per-item failure tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::cache::{CounterCache, CounterTotals, DailyCounter, MemoryCounterCache};
    use crate::db::{RollupStore, SqliteRollupStore};
    use crate::error::{Result, StatsError};
    use crate::model::{
        AccumulatedStatistics, DailyStatistics, Distribution, PlanRollup, StatKey,
    };

    /// Rollup store whose writes fail for one stat key.
    pub struct FlakyRollupStore {
        inner: SqliteRollupStore,
        fail_stat_key: String,
    }

    impl FlakyRollupStore {
        pub fn failing(inner: SqliteRollupStore, stat_key: &str) -> Self {
            Self {
                inner,
                fail_stat_key: stat_key.to_string(),
            }
        }

        fn check(&self, key: &StatKey) -> Result<()> {
            if key.stat_key == self.fail_stat_key {
                return Err(StatsError::Cache(format!("write refused for {}", key.stat_key)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RollupStore for FlakyRollupStore {
        async fn get_accumulated(&self, key: &StatKey) -> Result<Option<AccumulatedStatistics>> {
            self.inner.get_accumulated(key).await
        }

        async fn upsert_accumulated(&self, stats: &AccumulatedStatistics) -> Result<()> {
            self.check(&stats.key)?;
            self.inner.upsert_accumulated(stats).await
        }

        async fn upsert_daily(&self, row: &DailyStatistics) -> Result<()> {
            self.check(&row.key)?;
            self.inner.upsert_daily(row).await
        }

        async fn get_daily_range(
            &self,
            key: &StatKey,
            from: NaiveDate,
            to: NaiveDate,
        ) -> Result<Vec<DailyStatistics>> {
            self.inner.get_daily_range(key, from, to).await
        }

        async fn fold_daily_into_accumulated(
            &self,
            key: &StatKey,
            distribution: Option<Distribution>,
        ) -> Result<Option<AccumulatedStatistics>> {
            self.check(key)?;
            self.inner.fold_daily_into_accumulated(key, distribution).await
        }

        async fn get_plan(&self, org_id: i64, plan_id: i64) -> Result<Option<PlanRollup>> {
            self.inner.get_plan(org_id, plan_id).await
        }

        async fn upsert_plan(&self, rollup: &PlanRollup) -> Result<()> {
            self.inner.upsert_plan(rollup).await
        }
    }

    /// Counter cache that can fail every scan or the read of one counter key.
    pub struct FlakyCache {
        pub inner: MemoryCounterCache,
        pub fail_scan: bool,
        pub fail_read_key: Option<String>,
    }

    impl FlakyCache {
        pub fn new(inner: MemoryCounterCache) -> Self {
            Self {
                inner,
                fail_scan: false,
                fail_read_key: None,
            }
        }

        fn check_read(&self, key: &str) -> Result<()> {
            if self.fail_read_key.as_deref() == Some(key) {
                return Err(StatsError::Cache(format!("read refused for {key}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterCache for FlakyCache {
        async fn scan_daily_counters(&self, prefix: &str) -> Result<Vec<String>> {
            if self.fail_scan {
                return Err(StatsError::Cache("scan refused".to_string()));
            }
            self.inner.scan_daily_counters(prefix).await
        }

        async fn get_daily_counter(&self, key: &str) -> Result<Option<DailyCounter>> {
            self.check_read(key)?;
            self.inner.get_daily_counter(key).await
        }

        async fn get_accumulated_counter(&self, key: &str) -> Result<Option<CounterTotals>> {
            self.check_read(key)?;
            self.inner.get_accumulated_counter(key).await
        }

        async fn get_snapshot(&self, key: &str) -> Result<Option<String>> {
            self.inner.get_snapshot(key).await
        }

        async fn set_snapshot(&self, key: &str, payload: String, ttl: Duration) -> Result<()> {
            self.inner.set_snapshot(key, payload, ttl).await
        }

        async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.inner.try_lock(key, token, ttl).await
        }

        async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
            self.inner.unlock(key, token).await
        }
    }
}
