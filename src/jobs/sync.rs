//! Promotion of volatile counters into durable rollups

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Local};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{discover_orgs, scan_counters, with_lock, BatchOptions, RunOutcome, SyncReport};
use crate::aggregator::{aggregate_daily_counts, fill_daily_series};
use crate::cache::CounterCache;
use crate::db::{RawAggregator, RollupStore};
use crate::error::{Result, StatsError};
use crate::model::{
    AccumulatedStatistics, DailyStatistics, Distribution, StatKey, StatType,
};
use crate::query::{local_midnight, TREND_DAYS};

pub struct Synchronizer {
    cache: Arc<dyn CounterCache>,
    rollups: Arc<dyn RollupStore>,
    raw: RawAggregator,
    options: BatchOptions,
}

impl Synchronizer {
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

    /// Copy every daily counter into its daily rollup row.
    ///
    /// Rows are overwritten with the counter's current value, so re-running
    /// with unchanged counters leaves the rollups unchanged.
    pub async fn sync_daily_statistics(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome<SyncReport>> {
        with_lock(
            self.cache.as_ref(),
            &self.options,
            "sync_daily",
            self.run_daily(cancel),
        )
        .await
    }

    /// Fold daily rollups into accumulated rollups for every counted subject,
    /// then rebuild each organization's system rollup from source tables.
    pub async fn sync_accumulated_statistics(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome<SyncReport>> {
        with_lock(
            self.cache.as_ref(),
            &self.options,
            "sync_accumulated",
            self.run_accumulated(cancel),
        )
        .await
    }

    /// Rebuild every plan rollup from the task table.
    pub async fn sync_plan_statistics(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome<SyncReport>> {
        with_lock(
            self.cache.as_ref(),
            &self.options,
            "sync_plan",
            self.run_plans(cancel),
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn run_daily(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let orgs = discover_orgs(self.cache.as_ref(), &self.raw).await?;

        for org_id in orgs {
            for &stat_type in &self.options.tracked_stat_types {
                let (counters, malformed) =
                    scan_counters(self.cache.as_ref(), org_id, stat_type).await?;
                report.skipped += malformed;

                for counter in counters {
                    if cancel.is_cancelled() {
                        return Err(StatsError::Interrupted {
                            processed: report.processed,
                        });
                    }
                    let value = match self.cache.get_daily_counter(&counter.raw_key).await {
                        Ok(Some(value)) => value,
                        Ok(None) => {
                            debug!(key = %counter.raw_key, "Counter vanished after scan");
                            report.skipped += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(key = %counter.raw_key, error = %e, "Failed to read counter");
                            report.failed += 1;
                            continue;
                        }
                    };

                    let row = DailyStatistics {
                        key: counter.key,
                        date: counter.date,
                        submission_count: value.submission_count,
                        completion_count: value.completion_count,
                    };
                    match self.rollups.upsert_daily(&row).await {
                        Ok(()) => report.processed += 1,
                        Err(e) => {
                            warn!(key = %counter.raw_key, error = %e, "Failed to upsert daily rollup");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "Daily statistics synced"
        );
        Ok(report)
    }

    #[tracing::instrument(skip_all)]
    async fn run_accumulated(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let orgs = discover_orgs(self.cache.as_ref(), &self.raw).await?;

        for &org_id in &orgs {
            for &stat_type in &self.options.tracked_stat_types {
                let (counters, malformed) =
                    scan_counters(self.cache.as_ref(), org_id, stat_type).await?;
                report.skipped += malformed;
                let subjects: BTreeSet<StatKey> = counters.into_iter().map(|c| c.key).collect();

                for key in subjects {
                    if cancel.is_cancelled() {
                        return Err(StatsError::Interrupted {
                            processed: report.processed,
                        });
                    }
                    let distribution = self.subject_distribution(&key).await;
                    match self.rollups.fold_daily_into_accumulated(&key, distribution).await {
                        Ok(Some(acc)) => {
                            debug!(
                                stat_key = %key.stat_key,
                                total_submissions = acc.total_submissions,
                                "Accumulated rollup updated"
                            );
                            if key.stat_type == StatType::Testee {
                                self.stamp_testee_instants(acc).await;
                            }
                            report.processed += 1;
                        }
                        Ok(None) => {
                            debug!(stat_key = %key.stat_key, "No daily rows to fold yet");
                            report.skipped += 1;
                        }
                        Err(e) => {
                            warn!(org_id, stat_key = %key.stat_key, error = %e, "Failed to fold daily rollups");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        for &org_id in &orgs {
            if cancel.is_cancelled() {
                return Err(StatsError::Interrupted {
                    processed: report.processed,
                });
            }
            match self.sync_system(org_id).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(org_id, error = %e, "Failed to sync system statistics");
                    report.failed += 1;
                }
            }
        }

        info!(
            orgs = orgs.len(),
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "Accumulated statistics synced"
        );
        Ok(report)
    }

    /// Dimensions recomputed from source tables for one subject. A failure
    /// keeps whatever distribution the rollup already has.
    async fn subject_distribution(&self, key: &StatKey) -> Option<Distribution> {
        let result = match key.stat_type {
            StatType::Questionnaire => self
                .raw
                .origin_distribution(key.org_id, &key.stat_key)
                .await
                .map(|origin| Distribution {
                    origin: Some(origin),
                    ..Default::default()
                }),
            StatType::Testee => {
                let Ok(testee_id) = key.stat_key.parse::<i64>() else {
                    warn!(stat_key = %key.stat_key, "Testee stat key is not numeric");
                    return None;
                };
                self.raw
                    .risk_distribution(key.org_id, testee_id)
                    .await
                    .map(|risk| Distribution {
                        risk: Some(risk),
                        ..Default::default()
                    })
            }
            _ => return None,
        };
        match result {
            Ok(distribution) => Some(distribution),
            Err(e) => {
                warn!(stat_key = %key.stat_key, error = %e, "Failed to compute distribution");
                None
            }
        }
    }

    /// Replace the day-granular first/last bounds of a testee rollup with the
    /// exact assessment instants so both read paths report the same values.
    /// On failure the day bounds stay.
    async fn stamp_testee_instants(&self, mut acc: AccumulatedStatistics) {
        let Ok(testee_id) = acc.key.stat_key.parse::<i64>() else {
            return;
        };
        match self.raw.testee_summary(acc.key.org_id, testee_id).await {
            Ok(summary) if summary.first_at.is_some() => {
                acc.first_occurred_at = summary.first_at;
                acc.last_occurred_at = summary.last_at;
                if let Err(e) = self.rollups.upsert_accumulated(&acc).await {
                    warn!(testee_id, error = %e, "Failed to store assessment instants");
                }
            }
            Ok(_) => debug!(testee_id, "No live assessments, keeping day bounds"),
            Err(e) => warn!(testee_id, error = %e, "Failed to read assessment instants"),
        }
    }

    /// Rebuild the system rollup and its daily assessment series for one org.
    async fn sync_system(&self, org_id: i64) -> Result<()> {
        let key = StatKey::system(org_id);
        let today = Local::now().date_naive();
        let trend_start = today - Duration::days(TREND_DAYS as i64 - 1);

        let summary = self
            .raw
            .system_summary(org_id, local_midnight(today))
            .await?;
        let mut acc = AccumulatedStatistics::empty(key.clone());
        acc.set_totals(summary.assessment_count, summary.status.interpreted);
        acc.first_occurred_at = summary.first_at;
        acc.last_occurred_at = summary.last_at;
        acc.distribution = Distribution {
            status: Some(summary.status),
            system: Some(summary.totals),
            ..Default::default()
        };

        let timestamps = self
            .raw
            .assessment_timestamps_since(org_id, local_midnight(trend_start))
            .await?;
        let series = fill_daily_series(&aggregate_daily_counts(&timestamps), today, TREND_DAYS);

        for day in series {
            self.rollups
                .upsert_daily(&DailyStatistics {
                    key: key.clone(),
                    date: day.date,
                    submission_count: day.count,
                    completion_count: 0,
                })
                .await?;
        }
        self.rollups.upsert_accumulated(&acc).await
    }

    #[tracing::instrument(skip_all)]
    async fn run_plans(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let plans = self.raw.list_plans().await?;

        for (org_id, plan_id) in plans {
            if cancel.is_cancelled() {
                return Err(StatsError::Interrupted {
                    processed: report.processed,
                });
            }
            let rollup = match self.raw.plan_summary(org_id, plan_id).await {
                Ok(rollup) => rollup,
                Err(e) => {
                    warn!(org_id, plan_id, error = %e, "Failed to aggregate plan tasks");
                    report.failed += 1;
                    continue;
                }
            };
            match self.rollups.upsert_plan(&rollup).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(org_id, plan_id, error = %e, "Failed to upsert plan rollup");
                    report.failed += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            "Plan statistics synced"
        );
        Ok(report)
    }
}
