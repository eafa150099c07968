//! Counter cache on a shared Redis instance
//!
//! Counters are hashes written by the event-recording path:
//! `HINCRBY stats:daily:... submission_count 1`. Snapshots are plain strings
//! with a `PX` expiry and locks use `SET NX PX` with a token.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::debug;

use super::{CounterCache, CounterTotals, DailyCounter};
use crate::error::{Result, StatsError};

const SCAN_BATCH: usize = 500;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisCounterCache {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    op_timeout: Duration,
    unlock_script: Script,
}

impl RedisCounterCache {
    /// Parses `url` without connecting; the connection opens on first use.
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
            op_timeout,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn bounded<T>(&self, op: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match timeout(self.op_timeout, op).await {
            Ok(res) => res.map_err(StatsError::from),
            Err(_) => Err(StatsError::Cache(format!(
                "redis operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("Opening redis connection");
                self.bounded(self.client.get_multiplexed_async_connection())
                    .await
            })
            .await?;
        Ok(conn.clone())
    }
}

/// SCAN MATCH pattern selecting every key that starts with `prefix`.
pub(crate) fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('*');
    pattern
}

/// An empty hash is a missing counter; absent fields count as zero.
pub(crate) fn daily_counter_from_fields(fields: &HashMap<String, i64>) -> Option<DailyCounter> {
    if fields.is_empty() {
        return None;
    }
    Some(DailyCounter {
        submission_count: fields.get("submission_count").copied().unwrap_or(0),
        completion_count: fields.get("completion_count").copied().unwrap_or(0),
    })
}

pub(crate) fn totals_from_fields(fields: &HashMap<String, i64>) -> Option<CounterTotals> {
    if fields.is_empty() {
        return None;
    }
    Some(CounterTotals {
        total_submissions: fields.get("total_submissions").copied().unwrap_or(0),
        total_completions: fields.get("total_completions").copied().unwrap_or(0),
    })
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterCache for RedisCounterCache {
    async fn scan_daily_counters(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = scan_pattern(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may repeat keys across batches
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn get_daily_counter(&self, key: &str) -> Result<Option<DailyCounter>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, i64> = self
            .bounded(redis::cmd("HGETALL").arg(key).query_async(&mut conn))
            .await?;
        Ok(daily_counter_from_fields(&fields))
    }

    async fn get_accumulated_counter(&self, key: &str) -> Result<Option<CounterTotals>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, i64> = self
            .bounded(redis::cmd("HGETALL").arg(key).query_async(&mut conn))
            .await?;
        Ok(totals_from_fields(&fields))
    }

    async fn get_snapshot(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        self.bounded(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set_snapshot(&self, key: &str, payload: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn),
        )
        .await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .bounded(
                self.unlock_script
                    .key(key)
                    .arg(token)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pattern_escapes_glob_characters() {
        assert_eq!(scan_pattern("stats:daily:1:questionnaire:"), "stats:daily:1:questionnaire:*");
        assert_eq!(scan_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn hash_fields_decode_into_counters() {
        assert_eq!(daily_counter_from_fields(&HashMap::new()), None);

        let fields = HashMap::from([("submission_count".to_string(), 4)]);
        assert_eq!(
            daily_counter_from_fields(&fields),
            Some(DailyCounter {
                submission_count: 4,
                completion_count: 0
            })
        );

        let fields = HashMap::from([
            ("total_submissions".to_string(), 9),
            ("total_completions".to_string(), 2),
        ]);
        assert_eq!(
            totals_from_fields(&fields),
            Some(CounterTotals {
                total_submissions: 9,
                total_completions: 2
            })
        );
    }

    #[test]
    fn new_rejects_malformed_url() {
        assert!(RedisCounterCache::new("not a url", Duration::from_millis(100)).is_err());
        assert!(RedisCounterCache::new("redis://127.0.0.1:6379/0", Duration::from_millis(100)).is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        // port 1 refuses connections on any sane host
        let cache = RedisCounterCache::new("redis://127.0.0.1:1/", Duration::from_millis(500)).unwrap();
        assert!(cache.scan_daily_counters("stats:daily:").await.is_err());
        assert!(cache.get_snapshot("system:1").await.is_err());
    }

    /// Runs against a live server when `ASSESSMENT_STATS_TEST_REDIS_URL` is set.
    #[tokio::test]
    async fn live_round_trip() {
        let Ok(url) = std::env::var("ASSESSMENT_STATS_TEST_REDIS_URL") else {
            return;
        };
        let cache = RedisCounterCache::new(&url, Duration::from_secs(2)).unwrap();
        let mut conn = cache.connection().await.unwrap();
        let key = format!("stats:daily:990001:questionnaire:{}:2026-01-01", uuid::Uuid::new_v4());
        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("submission_count")
            .arg(3)
            .arg("completion_count")
            .arg(1)
            .query_async(&mut conn)
            .await
            .unwrap();

        let keys = cache.scan_daily_counters("stats:daily:990001:").await.unwrap();
        assert!(keys.contains(&key));
        assert_eq!(
            cache.get_daily_counter(&key).await.unwrap(),
            Some(DailyCounter {
                submission_count: 3,
                completion_count: 1
            })
        );

        let lock = format!("stats:lock:{}", uuid::Uuid::new_v4());
        assert!(cache.try_lock(&lock, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.try_lock(&lock, "b", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.unlock(&lock, "b").await.unwrap());
        assert!(cache.unlock(&lock, "a").await.unwrap());

        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }
}
