use tokio_util::sync::CancellationToken;

use super::{cancellable, QueryGateway};
use crate::aggregator::calculate_completion_rate;
use crate::cache::testee_snapshot_key;
use crate::db::TesteeSummary;
use crate::error::Result;
use crate::model::{RiskDistribution, StatKey, StatType, TesteeStatistics};

impl QueryGateway {
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_testee_statistics(
        &self,
        cancel: &CancellationToken,
        org_id: i64,
        testee_id: i64,
    ) -> Result<TesteeStatistics> {
        let snapshot_key = testee_snapshot_key(org_id, testee_id);
        if let Some(hit) = self.lookup_snapshot(cancel, &snapshot_key).await? {
            return Ok(hit);
        }

        let key = StatKey::new(org_id, StatType::Testee, testee_id.to_string());
        let view = match cancellable(cancel, self.rollups.get_accumulated(&key)).await? {
            Some(acc) => build_view(
                org_id,
                testee_id,
                TesteeSummary {
                    total: acc.total_submissions,
                    completed: acc.total_completions,
                    first_at: acc.first_occurred_at,
                    last_at: acc.last_occurred_at,
                },
                acc.distribution.risk.unwrap_or_default(),
            ),
            None => {
                tracing::debug!(org_id, testee_id, "No testee rollup, aggregating from assessments");
                let summary = cancellable(cancel, self.raw.testee_summary(org_id, testee_id)).await?;
                let risk = cancellable(cancel, self.raw.risk_distribution(org_id, testee_id)).await?;
                build_view(org_id, testee_id, summary, risk)
            }
        };

        self.store_snapshot(&snapshot_key, &view).await;
        Ok(view)
    }
}

fn build_view(
    org_id: i64,
    testee_id: i64,
    summary: TesteeSummary,
    risk: RiskDistribution,
) -> TesteeStatistics {
    TesteeStatistics {
        org_id,
        testee_id,
        total_assessments: summary.total,
        completed_assessments: summary.completed,
        pending_assessments: (summary.total - summary.completed).max(0),
        completion_rate: calculate_completion_rate(summary.total, summary.completed),
        risk,
        first_assessment_at: summary.first_at,
        last_assessment_at: summary.last_at,
    }
}
