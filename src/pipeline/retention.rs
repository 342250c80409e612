//! Retention manager for cleaning up old data.
//!
//! Raw samples and hourly buckets are only deleted below the watermark of
//! their next-coarser tier, so no row is removed before it has contributed to
//! a bucket, and the watermark bucket (recomputed on every run) keeps its
//! full input. Daily buckets are kept forever.

use crate::config::Config;
use crate::db::{BucketRepository, DbError, Granularity, TelemetryRepository};

use super::rollup::truncate_to_window;

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde::Serialize;

/// How long each tier is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub raw_days: u32,
    pub hourly_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_days: 7,
            hourly_months: 3,
        }
    }
}

impl From<&Config> for RetentionPolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            raw_days: cfg.raw_retention_days,
            hourly_months: cfg.hourly_retention_months,
        }
    }
}

/// Rows removed per tier by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub raw_deleted: usize,
    pub hourly_deleted: usize,
    /// True when storage was vacuumed to reclaim the freed pages.
    pub compacted: bool,
}

/// Delete aged raw and hourly rows, then compact storage.
///
/// Must run after the aggregator in the same cycle.
pub fn enforce_retention<S>(
    store: &S,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionReport, DbError>
where
    S: TelemetryRepository + BucketRepository,
{
    let mut report = RetentionReport::default();

    let raw_cutoff = now - ChronoDuration::days(policy.raw_days as i64);
    match safe_boundary(store, Granularity::Hour, raw_cutoff)? {
        Some(cutoff) => {
            report.raw_deleted = store.delete_samples_before(cutoff)?;
        }
        None => tracing::debug!("RetentionManager: no hourly buckets yet, keeping raw samples"),
    }

    let hourly_cutoff = now
        .checked_sub_months(Months::new(policy.hourly_months))
        .unwrap_or_else(|| now - ChronoDuration::days(30 * policy.hourly_months as i64));
    match safe_boundary(store, Granularity::Day, hourly_cutoff)? {
        Some(cutoff) => {
            report.hourly_deleted = store.delete_buckets_before(Granularity::Hour, cutoff)?;
        }
        None => tracing::debug!("RetentionManager: no daily buckets yet, keeping hourly buckets"),
    }

    report.compacted = report.raw_deleted > 0 || report.hourly_deleted > 0;
    store.compact(report.compacted)?;

    tracing::info!(
        "RetentionManager: deleted {} raw samples and {} hourly buckets (compacted: {})",
        report.raw_deleted,
        report.hourly_deleted,
        report.compacted
    );

    Ok(report)
}

/// Deletion cutoff for the tier below `granularity`: the age cutoff aligned
/// down to a window boundary, never past the watermark. `None` until the
/// tier has any buckets.
fn safe_boundary<S: BucketRepository>(
    store: &S,
    granularity: Granularity,
    age_cutoff: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let aligned = truncate_to_window(age_cutoff, granularity.window_seconds());
    Ok(store.watermark(granularity)?.map(|w| aligned.min(w)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RawSample, Store};
    use crate::pipeline::rollup::{roll_up_daily, roll_up_hourly};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 20, 12, 30, 0).unwrap()
    }

    fn sample(time: DateTime<Utc>) -> RawSample {
        RawSample {
            device_id: 1,
            user_id: 1,
            time,
            power: Some(10.0),
            energy_total: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_unaggregated_raw_samples_survive() {
        let store = Store::open_in_memory().unwrap();
        let old = now() - ChronoDuration::days(10);
        let recent = now() - ChronoDuration::hours(1);
        store.insert_samples(&[sample(old), sample(recent)]).unwrap();

        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.raw_deleted, 0);
        assert!(!report.compacted);
        assert!(store.latest_sample(1, None).unwrap().is_some());

        // Once rolled up, the aged sample is eligible
        roll_up_hourly(&store, now()).unwrap();
        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.raw_deleted, 1);
        assert!(report.compacted);
        assert_eq!(
            store.latest_sample(1, None).unwrap().map(|s| s.time),
            Some(recent)
        );
        assert_eq!(
            store.samples_between(old - ChronoDuration::days(1), now()).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_watermark_hour_keeps_its_input() {
        let store = Store::open_in_memory().unwrap();
        // Only one hour ever aggregated, and it is past the raw retention
        let old = now() - ChronoDuration::days(10);
        store.insert_samples(&[sample(old)]).unwrap();
        roll_up_hourly(&store, now()).unwrap();

        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.raw_deleted, 0);
        assert!(store.latest_sample(1, None).unwrap().is_some());
    }

    #[test]
    fn test_recent_raw_samples_are_kept() {
        let store = Store::open_in_memory().unwrap();
        let old = now() - ChronoDuration::days(8);
        let recent = now() - ChronoDuration::days(2);
        store.insert_samples(&[sample(old), sample(recent)]).unwrap();

        roll_up_hourly(&store, now()).unwrap();
        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.raw_deleted, 1);
        assert_eq!(
            store.latest_sample(1, None).unwrap().map(|s| s.time),
            Some(recent)
        );
    }

    #[test]
    fn test_hourly_deleted_only_after_daily_and_daily_kept() {
        let store = Store::open_in_memory().unwrap();
        let ancient = now() - ChronoDuration::days(200);
        let yesterday = now() - ChronoDuration::days(1);
        store.insert_samples(&[sample(ancient), sample(yesterday)]).unwrap();
        roll_up_hourly(&store, now()).unwrap();

        // Without a daily rollup the hourly row stays
        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.hourly_deleted, 0);
        assert_eq!(report.raw_deleted, 1);

        roll_up_daily(&store, now()).unwrap();
        let report = enforce_retention(&store, &RetentionPolicy::default(), now()).unwrap();
        assert_eq!(report.hourly_deleted, 1);
        assert_eq!(report.raw_deleted, 0);

        let days = store
            .buckets_between(Granularity::Day, ancient - ChronoDuration::days(1), now())
            .unwrap();
        assert_eq!(days.len(), 2);
    }
}
