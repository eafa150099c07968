use chrono::{Duration, Local, NaiveDate};
use tokio_util::sync::CancellationToken;

use super::{cancellable, QueryGateway, TREND_DAYS};
use crate::aggregator::{
    analyze_trend, calculate_completion_rate, fill_daily_series, sum_window,
};
use crate::cache::questionnaire_snapshot_key;
use crate::error::Result;
use crate::model::{
    DailyCount, DailyStatistics, OriginDistribution, QuestionnaireStatistics, StatKey, StatType,
};

/// Window over which the questionnaire trend percentage is computed.
const TREND_WINDOW_DAYS: u32 = 7;

impl QueryGateway {
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_questionnaire_statistics(
        &self,
        cancel: &CancellationToken,
        org_id: i64,
        questionnaire_code: &str,
    ) -> Result<QuestionnaireStatistics> {
        let snapshot_key = questionnaire_snapshot_key(org_id, questionnaire_code);
        if let Some(hit) = self.lookup_snapshot(cancel, &snapshot_key).await? {
            return Ok(hit);
        }

        let key = StatKey::new(org_id, StatType::Questionnaire, questionnaire_code);
        let today = Local::now().date_naive();

        let view = match cancellable(cancel, self.rollups.get_accumulated(&key)).await? {
            Some(acc) => {
                let daily = self.recent_daily(cancel, &key, today).await?;
                build_view(
                    &key,
                    acc.total_submissions,
                    acc.total_completions,
                    acc.distribution.origin.unwrap_or_default(),
                    &daily,
                    today,
                )
            }
            None => {
                tracing::debug!(org_id, questionnaire_code, "No rollup, aggregating from assessments");
                let (submissions, completions) = cancellable(
                    cancel,
                    self.raw.questionnaire_totals(org_id, questionnaire_code),
                )
                .await?;
                let origin = cancellable(
                    cancel,
                    self.raw.origin_distribution(org_id, questionnaire_code),
                )
                .await?;
                let daily = self.recent_daily(cancel, &key, today).await?;
                build_view(&key, submissions, completions, origin, &daily, today)
            }
        };

        self.store_snapshot(&snapshot_key, &view).await;
        Ok(view)
    }

    async fn recent_daily(
        &self,
        cancel: &CancellationToken,
        key: &StatKey,
        today: NaiveDate,
    ) -> Result<Vec<DailyStatistics>> {
        let from = today - Duration::days(TREND_DAYS as i64 - 1);
        cancellable(cancel, self.rollups.get_daily_range(key, from, today)).await
    }
}

fn build_view(
    key: &StatKey,
    total_submissions: i64,
    total_completions: i64,
    origin: OriginDistribution,
    daily: &[DailyStatistics],
    today: NaiveDate,
) -> QuestionnaireStatistics {
    let counts: Vec<DailyCount> = daily
        .iter()
        .map(|row| DailyCount {
            date: row.date,
            count: row.submission_count,
        })
        .collect();
    let daily_trend = fill_daily_series(&counts, today, TREND_DAYS);

    QuestionnaireStatistics {
        org_id: key.org_id,
        questionnaire_code: key.stat_key.clone(),
        total_submissions,
        total_completions,
        completion_rate: calculate_completion_rate(total_submissions, total_completions),
        last_7_days: sum_window(&counts, today, 7),
        last_15_days: sum_window(&counts, today, 15),
        last_30_days: sum_window(&counts, today, 30),
        origin,
        trend_percent: analyze_trend(&daily_trend, TREND_WINDOW_DAYS),
        daily_trend,
    }
}
