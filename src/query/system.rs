use chrono::{Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use super::{cancellable, QueryGateway, TREND_DAYS};
use crate::aggregator::{aggregate_daily_counts, calculate_completion_rate, fill_daily_series};
use crate::cache::system_snapshot_key;
use crate::error::Result;
use crate::model::{DailyCount, StatKey, StatusDistribution, SystemStatistics, SystemTotals};

impl QueryGateway {
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_system_statistics(
        &self,
        cancel: &CancellationToken,
        org_id: i64,
    ) -> Result<SystemStatistics> {
        let snapshot_key = system_snapshot_key(org_id);
        if let Some(hit) = self.lookup_snapshot(cancel, &snapshot_key).await? {
            return Ok(hit);
        }

        let key = StatKey::system(org_id);
        let today = Local::now().date_naive();
        let trend_start = today - Duration::days(TREND_DAYS as i64 - 1);

        let view = match cancellable(cancel, self.rollups.get_accumulated(&key)).await? {
            Some(acc) => {
                let daily = cancellable(cancel, self.rollups.get_daily_range(&key, trend_start, today))
                    .await?;
                let counts: Vec<DailyCount> = daily
                    .iter()
                    .map(|row| DailyCount {
                        date: row.date,
                        count: row.submission_count,
                    })
                    .collect();
                build_view(
                    org_id,
                    acc.total_submissions,
                    acc.total_completions,
                    acc.distribution.status.unwrap_or_default(),
                    acc.distribution.system.unwrap_or_default(),
                    fill_daily_series(&counts, today, TREND_DAYS),
                )
            }
            None => {
                tracing::debug!(org_id, "No system rollup, aggregating from source tables");
                let summary = cancellable(cancel, self.raw.system_summary(org_id, local_midnight(today)))
                    .await?;
                let timestamps = cancellable(
                    cancel,
                    self.raw
                        .assessment_timestamps_since(org_id, local_midnight(trend_start)),
                )
                .await?;
                build_view(
                    org_id,
                    summary.assessment_count,
                    summary.status.interpreted,
                    summary.status,
                    summary.totals,
                    fill_daily_series(&aggregate_daily_counts(&timestamps), today, TREND_DAYS),
                )
            }
        };

        self.store_snapshot(&snapshot_key, &view).await;
        Ok(view)
    }
}

/// Start of `date` in the server's local zone, as UTC.
pub(crate) fn local_midnight(date: NaiveDate) -> chrono::DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

fn build_view(
    org_id: i64,
    assessment_count: i64,
    completed: i64,
    status: StatusDistribution,
    totals: SystemTotals,
    assessment_trend: Vec<DailyCount>,
) -> SystemStatistics {
    SystemStatistics {
        org_id,
        questionnaire_count: totals.questionnaire_count,
        testee_count: totals.testee_count,
        assessment_count,
        assessment_status: status,
        today_new_assessments: totals.today_new_assessments,
        today_new_testees: totals.today_new_testees,
        today_completed_assessments: totals.today_completed_assessments,
        completion_rate: calculate_completion_rate(assessment_count, completed),
        assessment_trend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CounterCache;
    use crate::db::testing::{insert_assessment, insert_questionnaire, insert_testee, AssessmentFixture};
    use crate::db::RollupStore;
    use crate::model::{AccumulatedStatistics, Distribution};
    use crate::query::test_support::harness;

    #[tokio::test]
    async fn raw_path_counts_source_tables() {
        let h = harness().await;
        let pool = h.db.pool();
        insert_questionnaire(pool, 1, "Q1").await;
        let testee = insert_testee(pool, 1, Utc::now()).await;
        insert_assessment(pool, &AssessmentFixture::new(1, testee, "Q1")).await;
        insert_assessment(
            pool,
            &AssessmentFixture {
                status: "pending",
                ..AssessmentFixture::new(1, testee, "Q1")
            },
        )
        .await;

        let view = h
            .gateway
            .get_system_statistics(&CancellationToken::new(), 1)
            .await
            .unwrap();
        assert_eq!(view.questionnaire_count, 1);
        assert_eq!(view.testee_count, 1);
        assert_eq!(view.assessment_count, 2);
        assert_eq!(view.assessment_status.pending, 1);
        assert_eq!(view.completion_rate, 50.0);
        assert_eq!(view.today_new_assessments, 2);
        assert_eq!(view.assessment_trend.len(), TREND_DAYS as usize);
        assert_eq!(view.assessment_trend.last().map(|c| c.count), Some(2));
        assert!(h.cache.get_snapshot("system:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollup_path_decodes_typed_dimensions() {
        let h = harness().await;
        let mut acc = AccumulatedStatistics::empty(StatKey::system(3));
        acc.set_totals(10, 4);
        acc.distribution = Distribution {
            status: Some(StatusDistribution {
                interpreted: 4,
                submitted: 6,
                ..Default::default()
            }),
            system: Some(SystemTotals {
                questionnaire_count: 5,
                testee_count: 7,
                ..Default::default()
            }),
            ..Default::default()
        };
        h.rollups.upsert_accumulated(&acc).await.unwrap();

        let view = h
            .gateway
            .get_system_statistics(&CancellationToken::new(), 3)
            .await
            .unwrap();
        assert_eq!(view.assessment_count, 10);
        assert_eq!(view.completion_rate, 40.0);
        assert_eq!(view.questionnaire_count, 5);
        assert_eq!(view.testee_count, 7);
        assert_eq!(view.assessment_status.submitted, 6);
        assert!(view.assessment_trend.iter().all(|c| c.count == 0));
    }
}
