//! Reconciliation of accumulated rollups against the live counters

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{discover_orgs, scan_counters, with_lock, BatchOptions, RunOutcome, ScannedCounter, ValidationReport};
use crate::cache::{accumulated_counter_key, CounterCache, CounterTotals};
use crate::db::{RawAggregator, RollupStore};
use crate::error::{Result, StatsError};
use crate::model::StatKey;

enum Check {
    Consistent,
    Repaired,
    Missing,
}

pub struct Validator {
    cache: Arc<dyn CounterCache>,
    rollups: Arc<dyn RollupStore>,
    raw: RawAggregator,
    options: BatchOptions,
}

impl Validator {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        rollups: Arc<dyn RollupStore>,
        raw: RawAggregator,
        options: BatchOptions,
    ) -> Self {
        Self {
            cache,
            rollups,
            raw,
            options,
        }
    }

    /// Compare every counted subject's accumulated rollup with the counters
    /// and overwrite the rollup totals where they disagree. Counters are never
    /// modified. Subjects without a rollup are reported, not created.
    pub async fn validate_consistency(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome<ValidationReport>> {
        with_lock(
            self.cache.as_ref(),
            &self.options,
            "validate",
            self.run(cancel),
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn run(&self, cancel: &CancellationToken) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let orgs = discover_orgs(self.cache.as_ref(), &self.raw).await?;

        for org_id in orgs {
            for &stat_type in &self.options.tracked_stat_types {
                let (counters, _) = scan_counters(self.cache.as_ref(), org_id, stat_type).await?;
                let mut subjects: BTreeMap<StatKey, Vec<ScannedCounter>> = BTreeMap::new();
                for counter in counters {
                    subjects.entry(counter.key.clone()).or_default().push(counter);
                }

                for (key, days) in subjects {
                    if cancel.is_cancelled() {
                        return Err(StatsError::Interrupted {
                            processed: report.checked,
                        });
                    }
                    report.checked += 1;
                    match self.check(&key, &days).await {
                        Ok(Check::Consistent) => report.consistent += 1,
                        Ok(Check::Repaired) => report.repaired += 1,
                        Ok(Check::Missing) => report.missing += 1,
                        Err(e) => {
                            warn!(org_id, stat_key = %key.stat_key, error = %e, "Validation failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            checked = report.checked,
            consistent = report.consistent,
            repaired = report.repaired,
            missing = report.missing,
            failed = report.failed,
            "Consistency validation finished"
        );
        Ok(report)
    }

    async fn check(&self, key: &StatKey, days: &[ScannedCounter]) -> Result<Check> {
        let Some(stored) = self.rollups.get_accumulated(key).await? else {
            debug!(stat_key = %key.stat_key, "Counters exist but no rollup yet");
            return Ok(Check::Missing);
        };

        let truth = self.counter_totals(key, days).await?;
        let mut expected = stored.clone();
        expected.set_totals(truth.total_submissions, truth.total_completions);
        if expected.total_submissions == stored.total_submissions
            && expected.total_completions == stored.total_completions
        {
            return Ok(Check::Consistent);
        }

        warn!(
            org_id = key.org_id,
            stat_type = %key.stat_type,
            stat_key = %key.stat_key,
            stored_submissions = stored.total_submissions,
            counted_submissions = expected.total_submissions,
            stored_completions = stored.total_completions,
            counted_completions = expected.total_completions,
            "Rollup disagrees with counters, repairing"
        );
        self.rollups.upsert_accumulated(&expected).await?;
        Ok(Check::Repaired)
    }

    /// The write path's running totals when present, else the sum of the
    /// subject's live daily counters.
    async fn counter_totals(&self, key: &StatKey, days: &[ScannedCounter]) -> Result<CounterTotals> {
        if let Some(totals) = self
            .cache
            .get_accumulated_counter(&accumulated_counter_key(key))
            .await?
        {
            return Ok(totals);
        }

        let mut totals = CounterTotals::default();
        for day in days {
            if let Some(counter) = self.cache.get_daily_counter(&day.raw_key).await? {
                totals.total_submissions += counter.submission_count;
                totals.total_completions += counter.completion_count;
            }
        }
        Ok(totals)
    }
}
