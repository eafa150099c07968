//! Volatile counter and snapshot cache
//!
//! Counter keys are written by the event-recording path and only read here.
//! Snapshot keys hold JSON-serialized statistics views with a short TTL.

mod memory;
mod redis_store;

pub use memory::MemoryCounterCache;
pub use redis_store::RedisCounterCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{Result, StatsError};
use crate::model::{StatKey, StatType};

const DAILY_NAMESPACE: &str = "stats:daily";
const ACCUMULATED_NAMESPACE: &str = "stats:accum";
const LOCK_NAMESPACE: &str = "stats:lock";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Submission and completion tallies for one subject on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub submission_count: i64,
    pub completion_count: i64,
}

/// Running totals for one subject, maintained by the write path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTotals {
    pub total_submissions: i64,
    pub total_completions: i64,
}

#[async_trait]
pub trait CounterCache: Send + Sync {
    /// All daily counter keys starting with `prefix`, in key order.
    async fn scan_daily_counters(&self, prefix: &str) -> Result<Vec<String>>;

    async fn get_daily_counter(&self, key: &str) -> Result<Option<DailyCounter>>;

    async fn get_accumulated_counter(&self, key: &str) -> Result<Option<CounterTotals>>;

    async fn get_snapshot(&self, key: &str) -> Result<Option<String>>;

    async fn set_snapshot(&self, key: &str, payload: String, ttl: Duration) -> Result<()>;

    /// Set `key` to `token` only if no live lock exists.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key` only if it still holds `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}

/// Counter cache for the configured backend.
pub fn build_counter_cache(config: &CacheConfig) -> Result<Arc<dyn CounterCache>> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCounterCache::new(config.snapshot_ttl()))),
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| StatsError::Cache("redis backend needs cache.redis_url".to_string()))?;
            Ok(Arc::new(RedisCounterCache::new(url, config.redis_timeout())?))
        }
    }
}

/// `stats:daily:{org}:{type}:{key}:{date}`
pub fn daily_counter_key(key: &StatKey, date: NaiveDate) -> String {
    format!(
        "{DAILY_NAMESPACE}:{}:{}:{}:{}",
        key.org_id,
        key.stat_type,
        key.stat_key,
        date.format(DATE_FORMAT)
    )
}

/// Prefix matching every daily counter of one organization and stat type.
pub fn daily_counter_prefix(org_id: i64, stat_type: StatType) -> String {
    format!("{DAILY_NAMESPACE}:{org_id}:{stat_type}:")
}

/// Prefix matching every daily counter of every organization.
pub fn all_daily_counters_prefix() -> String {
    format!("{DAILY_NAMESPACE}:")
}

pub fn accumulated_counter_key(key: &StatKey) -> String {
    format!(
        "{ACCUMULATED_NAMESPACE}:{}:{}:{}",
        key.org_id, key.stat_type, key.stat_key
    )
}

pub fn lock_key(job: &str) -> String {
    format!("{LOCK_NAMESPACE}:{job}")
}

pub fn system_snapshot_key(org_id: i64) -> String {
    format!("system:{org_id}")
}

pub fn questionnaire_snapshot_key(org_id: i64, code: &str) -> String {
    format!("questionnaire:{org_id}:{code}")
}

pub fn testee_snapshot_key(org_id: i64, testee_id: i64) -> String {
    format!("testee:{org_id}:{testee_id}")
}

pub fn plan_snapshot_key(org_id: i64, plan_id: i64) -> String {
    format!("plan:{org_id}:{plan_id}")
}

/// Parse a daily counter key back into its subject and date.
///
/// Empty segments are discarded before counting; anything other than six
/// segments, or a segment that does not parse, is malformed.
pub fn parse_daily_counter_key(raw: &str) -> Result<(StatKey, NaiveDate)> {
    let parts: Vec<&str> = raw.split(':').filter(|s| !s.is_empty()).collect();
    if parts.len() != 6 {
        return Err(StatsError::InvalidKey(format!(
            "{raw}: expected 6 segments, found {}",
            parts.len()
        )));
    }
    if parts[0] != "stats" || parts[1] != "daily" {
        return Err(StatsError::InvalidKey(format!("{raw}: not a daily counter")));
    }
    let org_id: i64 = parts[2]
        .parse()
        .map_err(|_| StatsError::InvalidKey(format!("{raw}: bad org id")))?;
    let stat_type: StatType = parts[3]
        .parse()
        .map_err(|e: String| StatsError::InvalidKey(format!("{raw}: {e}")))?;
    let date = NaiveDate::parse_from_str(parts[5], DATE_FORMAT)
        .map_err(|_| StatsError::InvalidKey(format!("{raw}: bad date")))?;

    Ok((StatKey::new(org_id, stat_type, parts[4]), date))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_key_round_trips() {
        let key = StatKey::new(7, StatType::Questionnaire, "Q001");
        let date = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        let raw = daily_counter_key(&key, date);
        assert_eq!(raw, "stats:daily:7:questionnaire:Q001:2026-10-01");
        assert!(raw.starts_with(&daily_counter_prefix(7, StatType::Questionnaire)));
        assert_eq!(parse_daily_counter_key(&raw).unwrap(), (key, date));
    }

    #[test]
    fn parse_discards_empty_segments() {
        let (key, _) = parse_daily_counter_key("stats:daily::1:testee:42:2026-01-02").unwrap();
        assert_eq!(key, StatKey::new(1, StatType::Testee, "42"));
    }

    #[test]
    fn parse_rejects_wrong_segment_counts() {
        assert!(matches!(
            parse_daily_counter_key("stats:daily:1:questionnaire:2026-01-02"),
            Err(StatsError::InvalidKey(_))
        ));
        assert!(matches!(
            parse_daily_counter_key("stats:daily:1:questionnaire:Q:extra:2026-01-02"),
            Err(StatsError::InvalidKey(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_fields() {
        assert!(parse_daily_counter_key("stats:daily:x:questionnaire:Q:2026-01-02").is_err());
        assert!(parse_daily_counter_key("stats:daily:1:survey:Q:2026-01-02").is_err());
        assert!(parse_daily_counter_key("stats:daily:1:questionnaire:Q:20260102").is_err());
        assert!(parse_daily_counter_key("stats:hourly:1:questionnaire:Q:2026-01-02").is_err());
    }

    #[test]
    fn snapshot_keys_are_distinct_per_subject() {
        assert_eq!(system_snapshot_key(1), "system:1");
        assert_eq!(questionnaire_snapshot_key(1, "Q9"), "questionnaire:1:Q9");
        assert_eq!(testee_snapshot_key(1, 9), "testee:1:9");
        assert_eq!(plan_snapshot_key(1, 9), "plan:1:9");
        assert_eq!(lock_key("sync_daily"), "stats:lock:sync_daily");
        let key = StatKey::new(2, StatType::Testee, "5");
        assert_eq!(accumulated_counter_key(&key), "stats:accum:2:testee:5");
    }

    #[tokio::test]
    async fn backend_follows_config() {
        let memory = build_counter_cache(&CacheConfig::default()).unwrap();
        assert!(memory.scan_daily_counters("stats:daily:").await.unwrap().is_empty());

        let redis = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url: Some("redis://127.0.0.1:6379/0".to_string()),
            ..CacheConfig::default()
        };
        assert!(build_counter_cache(&redis).is_ok());

        let missing_url = CacheConfig {
            backend: CacheBackend::Redis,
            ..CacheConfig::default()
        };
        assert!(matches!(build_counter_cache(&missing_url), Err(StatsError::Cache(_))));
    }
}
