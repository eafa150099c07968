//! Durable rollup store
//!
//! Every write is a single `INSERT .. ON CONFLICT DO UPDATE` so concurrent
//! writers of the same row converge on the last value instead of corrupting it.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use super::{day_start, from_millis, to_millis};
use crate::error::{Result, StatsError};
use crate::model::{
    AccumulatedStatistics, DailyStatistics, Distribution, PlanRollup, StatKey,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn get_accumulated(&self, key: &StatKey) -> Result<Option<AccumulatedStatistics>>;

    async fn upsert_accumulated(&self, stats: &AccumulatedStatistics) -> Result<()>;

    /// Replace the counts of one daily row.
    async fn upsert_daily(&self, row: &DailyStatistics) -> Result<()>;

    /// Daily rows for `key` with `from <= date <= to`, ascending by date.
    async fn get_daily_range(
        &self,
        key: &StatKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStatistics>>;

    /// Sum every daily row of `key` into its accumulated row.
    ///
    /// Dimensions in `distribution` overwrite the stored ones; the rest are kept.
    /// Returns `None` without writing when the key has no daily rows.
    async fn fold_daily_into_accumulated(
        &self,
        key: &StatKey,
        distribution: Option<Distribution>,
    ) -> Result<Option<AccumulatedStatistics>>;

    async fn get_plan(&self, org_id: i64, plan_id: i64) -> Result<Option<PlanRollup>>;

    async fn upsert_plan(&self, rollup: &PlanRollup) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteRollupStore {
    pool: SqlitePool,
}

impl SqliteRollupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

type AccumulatedRow = (i64, i64, String, Option<i64>, Option<i64>);

#[async_trait]
impl RollupStore for SqliteRollupStore {
    #[tracing::instrument(skip(self), fields(org_id = key.org_id, stat_type = %key.stat_type, stat_key = %key.stat_key))]
    async fn get_accumulated(&self, key: &StatKey) -> Result<Option<AccumulatedStatistics>> {
        let row: Option<AccumulatedRow> = sqlx::query_as(
            r#"
            SELECT total_submissions, total_completions, distribution, first_occurred_at, last_occurred_at
            FROM statistics_accumulated
            WHERE org_id = ? AND stat_type = ? AND stat_key = ?
            "#,
        )
        .bind(key.org_id)
        .bind(key.stat_type.as_str())
        .bind(&key.stat_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((total_submissions, total_completions, distribution, first, last)) = row else {
            return Ok(None);
        };
        let distribution = match serde_json::from_str::<Distribution>(&distribution) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable distribution");
                Distribution::default()
            }
        };

        Ok(Some(AccumulatedStatistics {
            key: key.clone(),
            total_submissions,
            total_completions,
            distribution,
            first_occurred_at: first.and_then(from_millis),
            last_occurred_at: last.and_then(from_millis),
        }))
    }

    #[tracing::instrument(skip(self, stats), fields(org_id = stats.key.org_id, stat_type = %stats.key.stat_type, stat_key = %stats.key.stat_key))]
    async fn upsert_accumulated(&self, stats: &AccumulatedStatistics) -> Result<()> {
        let distribution = serde_json::to_string(&stats.distribution)?;
        sqlx::query(
            r#"
            INSERT INTO statistics_accumulated
                (org_id, stat_type, stat_key, total_submissions, total_completions, distribution,
                 first_occurred_at, last_occurred_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(org_id, stat_type, stat_key) DO UPDATE SET
                total_submissions = excluded.total_submissions,
                total_completions = excluded.total_completions,
                distribution = excluded.distribution,
                first_occurred_at = excluded.first_occurred_at,
                last_occurred_at = excluded.last_occurred_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stats.key.org_id)
        .bind(stats.key.stat_type.as_str())
        .bind(&stats.key.stat_key)
        .bind(stats.total_submissions)
        .bind(stats.total_completions)
        .bind(distribution)
        .bind(stats.first_occurred_at.map(to_millis))
        .bind(stats.last_occurred_at.map(to_millis))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, row), fields(org_id = row.key.org_id, stat_key = %row.key.stat_key, date = %row.date))]
    async fn upsert_daily(&self, row: &DailyStatistics) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO statistics_daily
                (org_id, stat_type, stat_key, stat_date, submission_count, completion_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(org_id, stat_type, stat_key, stat_date) DO UPDATE SET
                submission_count = excluded.submission_count,
                completion_count = excluded.completion_count
            "#,
        )
        .bind(row.key.org_id)
        .bind(row.key.stat_type.as_str())
        .bind(&row.key.stat_key)
        .bind(row.date.format(DATE_FORMAT).to_string())
        .bind(row.submission_count)
        .bind(row.completion_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(org_id = key.org_id, stat_key = %key.stat_key))]
    async fn get_daily_range(
        &self,
        key: &StatKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStatistics>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT stat_date, submission_count, completion_count
            FROM statistics_daily
            WHERE org_id = ? AND stat_type = ? AND stat_key = ? AND stat_date >= ? AND stat_date <= ?
            ORDER BY stat_date ASC
            "#,
        )
        .bind(key.org_id)
        .bind(key.stat_type.as_str())
        .bind(&key.stat_key)
        .bind(from.format(DATE_FORMAT).to_string())
        .bind(to.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(date, submission_count, completion_count)| {
                let date = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|_| {
                    StatsError::InvalidKey(format!("stored stat_date {date} is not YYYY-MM-DD"))
                })?;
                Ok(DailyStatistics {
                    key: key.clone(),
                    date,
                    submission_count,
                    completion_count,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self, distribution), fields(org_id = key.org_id, stat_type = %key.stat_type, stat_key = %key.stat_key))]
    async fn fold_daily_into_accumulated(
        &self,
        key: &StatKey,
        distribution: Option<Distribution>,
    ) -> Result<Option<AccumulatedStatistics>> {
        let (days, submissions, completions, first, last): (
            i64,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
        ) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(submission_count), SUM(completion_count), MIN(stat_date), MAX(stat_date)
            FROM statistics_daily
            WHERE org_id = ? AND stat_type = ? AND stat_key = ?
            "#,
        )
        .bind(key.org_id)
        .bind(key.stat_type.as_str())
        .bind(&key.stat_key)
        .fetch_one(&self.pool)
        .await?;

        if days == 0 {
            return Ok(None);
        }

        let mut stats = self
            .get_accumulated(key)
            .await?
            .unwrap_or_else(|| AccumulatedStatistics::empty(key.clone()));
        if let Some(distribution) = distribution {
            stats.distribution.merge(distribution);
        }
        stats.set_totals(submissions.unwrap_or(0), completions.unwrap_or(0));
        let parse = |d: Option<String>| {
            d.and_then(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT).ok())
                .map(day_start)
        };
        stats.first_occurred_at = parse(first);
        stats.last_occurred_at = parse(last);

        self.upsert_accumulated(&stats).await?;
        Ok(Some(stats))
    }

    #[tracing::instrument(skip(self))]
    async fn get_plan(&self, org_id: i64, plan_id: i64) -> Result<Option<PlanRollup>> {
        let row: Option<(i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT total_tasks, completed_tasks, pending_tasks, expired_tasks, enrolled_testees, active_testees
            FROM statistics_plan
            WHERE org_id = ? AND plan_id = ?
            "#,
        )
        .bind(org_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(total_tasks, completed_tasks, pending_tasks, expired_tasks, enrolled_testees, active_testees)| {
                PlanRollup {
                    org_id,
                    plan_id,
                    total_tasks,
                    completed_tasks,
                    pending_tasks,
                    expired_tasks,
                    enrolled_testees,
                    active_testees,
                }
            },
        ))
    }

    #[tracing::instrument(skip(self, rollup), fields(org_id = rollup.org_id, plan_id = rollup.plan_id))]
    async fn upsert_plan(&self, rollup: &PlanRollup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO statistics_plan
                (org_id, plan_id, total_tasks, completed_tasks, pending_tasks, expired_tasks,
                 enrolled_testees, active_testees, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(org_id, plan_id) DO UPDATE SET
                total_tasks = excluded.total_tasks,
                completed_tasks = excluded.completed_tasks,
                pending_tasks = excluded.pending_tasks,
                expired_tasks = excluded.expired_tasks,
                enrolled_testees = excluded.enrolled_testees,
                active_testees = excluded.active_testees,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(rollup.org_id)
        .bind(rollup.plan_id)
        .bind(rollup.total_tasks)
        .bind(rollup.completed_tasks)
        .bind(rollup.pending_tasks)
        .bind(rollup.expired_tasks)
        .bind(rollup.enrolled_testees)
        .bind(rollup.active_testees)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
