//! Aggregation straight from the transactional tables
//!
//! Used when no rollup exists yet and by the sync jobs to rebuild system and
//! plan rollups. All queries are scoped by org and skip soft-deleted rows.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use super::{from_millis, to_millis};
use crate::error::Result;
use crate::model::{
    OriginDistribution, PlanRollup, RiskDistribution, StatusDistribution, SystemTotals,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TesteeSummary {
    pub total: i64,
    pub completed: i64,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSummary {
    pub assessment_count: i64,
    pub status: StatusDistribution,
    pub totals: SystemTotals,
    /// Earliest and latest live assessment creation.
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RawAggregator {
    pool: SqlitePool,
}

impl RawAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Organizations owning any live questionnaire, testee, assessment or plan.
    #[tracing::instrument(skip(self))]
    pub async fn list_active_orgs(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT org_id FROM questionnaire WHERE deleted_at IS NULL
            UNION SELECT org_id FROM testee WHERE deleted_at IS NULL
            UNION SELECT org_id FROM assessment WHERE deleted_at IS NULL
            UNION SELECT org_id FROM assessment_plan WHERE deleted_at IS NULL
            ORDER BY org_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let orgs: BTreeSet<i64> = rows.into_iter().map(|(id,)| id).collect();
        Ok(orgs.into_iter().collect())
    }

    /// (submitted, interpreted) assessment counts for one questionnaire.
    #[tracing::instrument(skip(self))]
    pub async fn questionnaire_totals(&self, org_id: i64, code: &str) -> Result<(i64, i64)> {
        let row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(CASE WHEN status = 'interpreted' THEN 1 ELSE 0 END)
            FROM assessment
            WHERE org_id = ? AND questionnaire_code = ? AND submitted_at IS NOT NULL AND deleted_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.0, row.1.unwrap_or(0)))
    }

    #[tracing::instrument(skip(self))]
    pub async fn origin_distribution(&self, org_id: i64, code: &str) -> Result<OriginDistribution> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT origin_type, COUNT(*)
            FROM assessment
            WHERE org_id = ? AND questionnaire_code = ? AND submitted_at IS NOT NULL AND deleted_at IS NULL
            GROUP BY origin_type
            "#,
        )
        .bind(org_id)
        .bind(code)
        .fetch_all(&self.pool)
        .await?;

        let mut dist = OriginDistribution::default();
        for (origin, count) in rows {
            if !dist.record(&origin, count) {
                warn!(org_id, code, origin = %origin, "Unknown assessment origin");
            }
        }
        Ok(dist)
    }

    #[tracing::instrument(skip(self))]
    pub async fn testee_summary(&self, org_id: i64, testee_id: i64) -> Result<TesteeSummary> {
        let row: (i64, Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(CASE WHEN status = 'interpreted' THEN 1 ELSE 0 END),
                   MIN(created_at), MAX(created_at)
            FROM assessment
            WHERE org_id = ? AND testee_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(testee_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(TesteeSummary {
            total: row.0,
            completed: row.1.unwrap_or(0),
            first_at: row.2.and_then(from_millis),
            last_at: row.3.and_then(from_millis),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn risk_distribution(&self, org_id: i64, testee_id: i64) -> Result<RiskDistribution> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT risk_level, COUNT(*)
            FROM assessment
            WHERE org_id = ? AND testee_id = ? AND risk_level IS NOT NULL AND deleted_at IS NULL
            GROUP BY risk_level
            "#,
        )
        .bind(org_id)
        .bind(testee_id)
        .fetch_all(&self.pool)
        .await?;

        let mut dist = RiskDistribution::default();
        for (level, count) in rows {
            if !dist.record(&level, count) {
                warn!(org_id, testee_id, level = %level, "Unknown risk level");
            }
        }
        Ok(dist)
    }

    /// Organization-wide counts, status breakdown and deltas since `today_start`.
    #[tracing::instrument(skip(self))]
    pub async fn system_summary(&self, org_id: i64, today_start: DateTime<Utc>) -> Result<SystemSummary> {
        let today = to_millis(today_start);

        let (questionnaire_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM questionnaire WHERE org_id = ? AND deleted_at IS NULL",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let (testee_count, today_new_testees): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END)
            FROM testee
            WHERE org_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(today)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let (today_new_assessments, today_completed, first_at, last_at): (
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END),
                   SUM(CASE WHEN interpreted_at >= ? THEN 1 ELSE 0 END),
                   MIN(created_at), MAX(created_at)
            FROM assessment
            WHERE org_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(today)
        .bind(today)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM assessment
            WHERE org_id = ? AND deleted_at IS NULL
            GROUP BY status
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut status = StatusDistribution::default();
        let mut assessment_count = 0;
        for (name, count) in rows {
            assessment_count += count;
            if !status.record(&name, count) {
                warn!(org_id, status = %name, "Unknown assessment status");
            }
        }

        Ok(SystemSummary {
            assessment_count,
            status,
            totals: SystemTotals {
                questionnaire_count,
                testee_count,
                today_new_assessments: today_new_assessments.unwrap_or(0),
                today_new_testees: today_new_testees.unwrap_or(0),
                today_completed_assessments: today_completed.unwrap_or(0),
            },
            first_at: first_at.and_then(from_millis),
            last_at: last_at.and_then(from_millis),
        })
    }

    /// Creation instants of live assessments created at or after `since`.
    #[tracing::instrument(skip(self))]
    pub async fn assessment_timestamps_since(
        &self,
        org_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT created_at FROM assessment
            WHERE org_id = ? AND created_at >= ? AND deleted_at IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(org_id)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(|(ms,)| from_millis(ms)).collect())
    }

    /// Every live plan as (org_id, plan_id).
    #[tracing::instrument(skip(self))]
    pub async fn list_plans(&self) -> Result<Vec<(i64, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT org_id, id FROM assessment_plan WHERE deleted_at IS NULL ORDER BY org_id, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Task and testee counts for one plan. Cancelled tasks count toward the
    /// total only; active testees are those with at least one completed task.
    #[tracing::instrument(skip(self))]
    pub async fn plan_summary(&self, org_id: i64, plan_id: i64) -> Result<PlanRollup> {
        let row: (i64, Option<i64>, Option<i64>, Option<i64>, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status IN ('pending', 'opened') THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'expired' THEN 1 ELSE 0 END),
                   COUNT(DISTINCT testee_id)
            FROM assessment_task
            WHERE org_id = ? AND plan_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;

        let (active_testees,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT testee_id)
            FROM assessment_task
            WHERE org_id = ? AND plan_id = ? AND status = 'completed' AND deleted_at IS NULL
            "#,
        )
        .bind(org_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlanRollup {
            org_id,
            plan_id,
            total_tasks: row.0,
            completed_tasks: row.1.unwrap_or(0),
            pending_tasks: row.2.unwrap_or(0),
            expired_tasks: row.3.unwrap_or(0),
            enrolled_testees: row.4,
            active_testees,
        })
    }
}
