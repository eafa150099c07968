//! Pure statistics helpers: rates, daily bucketing and trend analysis

use std::collections::BTreeMap;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};

use crate::model::DailyCount;

/// Percentage of `completed` over `total`, 0 when nothing was started.
pub fn calculate_completion_rate(total: i64, completed: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (completed as f64 / total as f64) * 100.0
}

/// Percentage of `total` participants over the `target` population.
pub fn calculate_participation_rate(total: i64, target: i64) -> f64 {
    if target <= 0 {
        return 0.0;
    }
    (total as f64 / target as f64) * 100.0
}

/// Bucket timestamps by local calendar day, ascending by date.
pub fn aggregate_daily_counts(timestamps: &[DateTime<Utc>]) -> Vec<DailyCount> {
    let mut buckets: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for ts in timestamps {
        let day = ts.with_timezone(&Local).date_naive();
        *buckets.entry(day).or_insert(0) += 1;
    }
    buckets
        .into_iter()
        .map(|(date, count)| DailyCount { date, count })
        .collect()
}

/// Longest series [`fill_daily_series`] will materialize, about ten years.
pub const MAX_SERIES_DAYS: u32 = 3660;

/// Dense series of `days` buckets ending at `end` (inclusive); missing days are 0.
///
/// `days` is capped at [`MAX_SERIES_DAYS`], and the series stops early at the
/// earliest representable date.
pub fn fill_daily_series(counts: &[DailyCount], end: NaiveDate, days: u32) -> Vec<DailyCount> {
    let by_date: BTreeMap<NaiveDate, i64> = counts.iter().map(|c| (c.date, c.count)).collect();
    let mut series: Vec<DailyCount> = (0..days.min(MAX_SERIES_DAYS) as u64)
        .map_while(|offset| end.checked_sub_days(Days::new(offset)))
        .map(|date| DailyCount {
            date,
            count: by_date.get(&date).copied().unwrap_or(0),
        })
        .collect();
    series.reverse();
    series
}

/// Sum of counts over the `days` days ending at `end` (inclusive).
pub fn sum_window(counts: &[DailyCount], end: NaiveDate, days: u32) -> i64 {
    if days == 0 {
        return 0;
    }
    // a window reaching past the calendar covers everything up to `end`
    let start = end
        .checked_sub_days(Days::new(days as u64 - 1))
        .unwrap_or(NaiveDate::MIN);
    counts
        .iter()
        .filter(|c| c.date >= start && c.date <= end)
        .map(|c| c.count)
        .sum()
}

/// Percentage change of the most recent `window_days` window over the one before it.
///
/// Windows are anchored on the latest date in `daily_counts`. Returns 0 when
/// either window has no entries or the earlier window averages 0.
pub fn analyze_trend(daily_counts: &[DailyCount], window_days: u32) -> f64 {
    let Some(latest) = daily_counts.iter().map(|c| c.date).max() else {
        return 0.0;
    };
    if window_days == 0 {
        return 0.0;
    }

    let window = Days::new(window_days as u64);
    // no recent boundary means the recent window holds every entry
    let Some(recent_start) = latest.checked_sub_days(window) else {
        return 0.0;
    };
    let prior_start = recent_start.checked_sub_days(window);

    let mut recent = (0i64, 0i64);
    let mut prior = (0i64, 0i64);
    for c in daily_counts {
        if c.date > recent_start {
            recent.0 += c.count;
            recent.1 += 1;
        } else if prior_start.map_or(true, |start| c.date > start) {
            prior.0 += c.count;
            prior.1 += 1;
        }
    }

    if recent.1 == 0 || prior.1 == 0 {
        return 0.0;
    }
    let recent_mean = recent.0 as f64 / recent.1 as f64;
    let prior_mean = prior.0 as f64 / prior.1 as f64;
    if prior_mean == 0.0 {
        return 0.0;
    }
    (recent_mean - prior_mean) / prior_mean * 100.0
}
