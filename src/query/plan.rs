use tokio_util::sync::CancellationToken;

use super::{cancellable, QueryGateway};
use crate::aggregator::{calculate_completion_rate, calculate_participation_rate};
use crate::cache::plan_snapshot_key;
use crate::error::Result;
use crate::model::{PlanRollup, PlanStatistics};

impl QueryGateway {
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_plan_statistics(
        &self,
        cancel: &CancellationToken,
        org_id: i64,
        plan_id: i64,
    ) -> Result<PlanStatistics> {
        let snapshot_key = plan_snapshot_key(org_id, plan_id);
        if let Some(hit) = self.lookup_snapshot(cancel, &snapshot_key).await? {
            return Ok(hit);
        }

        let rollup = match cancellable(cancel, self.rollups.get_plan(org_id, plan_id)).await? {
            Some(rollup) => rollup,
            None => {
                tracing::debug!(org_id, plan_id, "No plan rollup, aggregating from tasks");
                cancellable(cancel, self.raw.plan_summary(org_id, plan_id)).await?
            }
        };
        let view = build_view(&rollup);

        self.store_snapshot(&snapshot_key, &view).await;
        Ok(view)
    }
}

fn build_view(rollup: &PlanRollup) -> PlanStatistics {
    PlanStatistics {
        org_id: rollup.org_id,
        plan_id: rollup.plan_id,
        total_tasks: rollup.total_tasks,
        completed_tasks: rollup.completed_tasks,
        pending_tasks: rollup.pending_tasks,
        expired_tasks: rollup.expired_tasks,
        completion_rate: calculate_completion_rate(rollup.total_tasks, rollup.completed_tasks),
        enrolled_testees: rollup.enrolled_testees,
        active_testees: rollup.active_testees,
        participation_rate: calculate_participation_rate(
            rollup.active_testees,
            rollup.enrolled_testees,
        ),
    }
}
