//! Rollup aggregator for compressing raw samples into hourly and daily buckets.
//!
//! Both granularities advance from a dataset-wide watermark: the latest
//! bucket already written. Each run recomputes the watermark bucket from its
//! complete input and every closed window after it, so repeated runs converge
//! on the same rows.

use crate::db::{Bucket, BucketRepository, DbError, Granularity, RawSample, Stat, TelemetryRepository};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Roll closed raw-sample hours into hourly buckets.
///
/// Returns the number of buckets written or updated.
pub fn roll_up_hourly<S>(store: &S, now: DateTime<Utc>) -> Result<usize, DbError>
where
    S: TelemetryRepository + BucketRepository,
{
    let Some((start, end)) = pending_range(store, Granularity::Hour, now)? else {
        return Ok(0);
    };

    let samples = store.samples_between(start, end)?;
    if samples.is_empty() {
        tracing::debug!("Aggregator: no raw samples in {} .. {}", start, end);
        return Ok(0);
    }

    let sample_count = samples.len();
    let groups = group_by_window(samples, Granularity::Hour, |s| (s.device_id, s.time));
    let buckets: Vec<Bucket> = groups
        .into_iter()
        .map(|((device_id, bucket_start), rows)| aggregate_samples(device_id, bucket_start, &rows))
        .collect();

    let written = store.upsert_buckets(Granularity::Hour, &buckets)?;
    tracing::info!(
        "Aggregator: wrote {} hourly buckets from {} samples ({} .. {})",
        written,
        sample_count,
        start.format("%Y-%m-%d %H:%M"),
        end.format("%Y-%m-%d %H:%M")
    );
    Ok(written)
}

/// Roll closed days of hourly buckets into daily buckets.
///
/// Consumes hourly rows rather than raw samples, so any counter-reset flag
/// set at the hourly level carries into the day.
pub fn roll_up_daily<S>(store: &S, now: DateTime<Utc>) -> Result<usize, DbError>
where
    S: BucketRepository,
{
    let Some((start, end)) = pending_range(store, Granularity::Day, now)? else {
        return Ok(0);
    };

    let hours = store.buckets_between(Granularity::Hour, start, end)?;
    if hours.is_empty() {
        tracing::debug!("Aggregator: no hourly buckets in {} .. {}", start, end);
        return Ok(0);
    }

    let hour_count = hours.len();
    let groups = group_by_window(hours, Granularity::Day, |b| (b.device_id, b.time_bucket));
    let buckets: Vec<Bucket> = groups
        .into_iter()
        .map(|((device_id, day_start), rows)| aggregate_hours(device_id, day_start, &rows))
        .collect();

    let written = store.upsert_buckets(Granularity::Day, &buckets)?;
    tracing::info!(
        "Aggregator: wrote {} daily buckets from {} hourly buckets ({} .. {})",
        written,
        hour_count,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    Ok(written)
}

/// Range of input rows still to aggregate: from the watermark up to the
/// start of the window `now` falls in.
fn pending_range<S: BucketRepository>(
    store: &S,
    granularity: Granularity,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, DbError> {
    let start = store
        .watermark(granularity)?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let end = truncate_to_window(now, granularity.window_seconds());

    if end <= start {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

fn group_by_window<T, F>(
    rows: Vec<T>,
    granularity: Granularity,
    key: F,
) -> BTreeMap<(i64, DateTime<Utc>), Vec<T>>
where
    F: Fn(&T) -> (i64, DateTime<Utc>),
{
    let mut groups: BTreeMap<(i64, DateTime<Utc>), Vec<T>> = BTreeMap::new();
    for row in rows {
        let (device_id, time) = key(&row);
        let window_start = truncate_to_window(time, granularity.window_seconds());
        groups.entry((device_id, window_start)).or_default().push(row);
    }
    groups
}

/// Aggregate one device's raw samples for one hour.
pub fn aggregate_samples(device_id: i64, bucket_start: DateTime<Utc>, samples: &[RawSample]) -> Bucket {
    let mut ordered: Vec<&RawSample> = samples.iter().collect();
    ordered.sort_by_key(|s| s.time);

    let counters: Vec<f64> = ordered.iter().filter_map(|s| s.energy_total).collect();
    let energy_start = counters.first().copied();
    let energy_end = counters.last().copied();
    let counter_reset = counters.windows(2).any(|w| w[1] < w[0]);
    let energy_consumed = match (energy_start, energy_end) {
        (Some(first), Some(last)) if !counter_reset => Some(last - first),
        _ => None,
    };

    if counter_reset {
        tracing::warn!(
            "Aggregator: energy counter reset for device {} in hour {}, consumption left unset",
            device_id,
            bucket_start.format("%Y-%m-%d %H:%M")
        );
    }

    Bucket {
        granularity: Granularity::Hour,
        device_id,
        user_id: ordered.first().map(|s| s.user_id).unwrap_or_default(),
        time_bucket: bucket_start,
        voltage: stat_of(ordered.iter().map(|s| s.voltage)),
        current: stat_of(ordered.iter().map(|s| s.current)),
        power: stat_of(ordered.iter().map(|s| s.power)),
        power_factor: stat_of(ordered.iter().map(|s| s.power_factor)),
        energy_start,
        energy_end,
        energy_consumed,
        counter_reset,
        data_points: ordered.len() as i64,
        first_reading: ordered.first().map(|s| s.time).unwrap_or(bucket_start),
        last_reading: ordered.last().map(|s| s.time).unwrap_or(bucket_start),
        hours_active: None,
    }
}

/// Aggregate one device's hourly buckets for one day.
pub fn aggregate_hours(device_id: i64, day_start: DateTime<Utc>, hours: &[Bucket]) -> Bucket {
    let mut ordered: Vec<&Bucket> = hours.iter().collect();
    ordered.sort_by_key(|b| b.time_bucket);

    let with_energy: Vec<(f64, f64)> = ordered
        .iter()
        .filter_map(|b| Some((b.energy_start?, b.energy_end?)))
        .collect();
    let energy_start = with_energy.first().map(|&(start, _)| start);
    let energy_end = with_energy.last().map(|&(_, end)| end);

    // A reset either inside an hour or between two consecutive hours
    let counter_reset = ordered.iter().any(|b| b.counter_reset)
        || with_energy.windows(2).any(|w| w[1].0 < w[0].1);
    let energy_consumed = match (energy_start, energy_end) {
        (Some(first), Some(last)) if !counter_reset => Some(last - first),
        _ => None,
    };

    if counter_reset {
        tracing::warn!(
            "Aggregator: energy counter reset for device {} on {}, consumption left unset",
            device_id,
            day_start.format("%Y-%m-%d")
        );
    }

    let weighted = |f: fn(&Bucket) -> Stat| -> Stat {
        merge_stats(ordered.iter().map(|b| (f(*b), b.data_points)))
    };

    Bucket {
        granularity: Granularity::Day,
        device_id,
        user_id: ordered.first().map(|b| b.user_id).unwrap_or_default(),
        time_bucket: day_start,
        voltage: weighted(|b| b.voltage),
        current: weighted(|b| b.current),
        power: weighted(|b| b.power),
        power_factor: weighted(|b| b.power_factor),
        energy_start,
        energy_end,
        energy_consumed,
        counter_reset,
        data_points: ordered.iter().map(|b| b.data_points).sum(),
        first_reading: ordered
            .iter()
            .map(|b| b.first_reading)
            .min()
            .unwrap_or(day_start),
        last_reading: ordered
            .iter()
            .map(|b| b.last_reading)
            .max()
            .unwrap_or(day_start),
        hours_active: Some(ordered.len() as i64),
    }
}

fn stat_of(values: impl Iterator<Item = Option<f64>>) -> Stat {
    let mut stat = Stat::default();
    let mut sum = 0.0;
    let mut n = 0usize;

    for v in values.flatten() {
        sum += v;
        n += 1;
        stat.min = Some(stat.min.map_or(v, |m| m.min(v)));
        stat.max = Some(stat.max.map_or(v, |m| m.max(v)));
    }

    if n > 0 {
        stat.avg = Some(sum / n as f64);
    }
    stat
}

/// Combine per-hour stats, weighting averages by each hour's sample count.
fn merge_stats(parts: impl Iterator<Item = (Stat, i64)>) -> Stat {
    let mut stat = Stat::default();
    let mut weighted_sum = 0.0;
    let mut weight = 0i64;

    for (part, points) in parts {
        if let Some(avg) = part.avg {
            weighted_sum += avg * points as f64;
            weight += points;
        }
        if let Some(v) = part.min {
            stat.min = Some(stat.min.map_or(v, |m| m.min(v)));
        }
        if let Some(v) = part.max {
            stat.max = Some(stat.max.map_or(v, |m| m.max(v)));
        }
    }

    if weight > 0 {
        stat.avg = Some(weighted_sum / weight as f64);
    }
    stat
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, m, 0).unwrap()
    }

    fn sample(device_id: i64, time: DateTime<Utc>, power: f64, energy_total: f64) -> RawSample {
        RawSample {
            device_id,
            user_id: 1,
            time,
            voltage: Some(230.0),
            current: Some(power / 230.0),
            power: Some(power),
            power_factor: Some(0.95),
            energy_total: Some(energy_total),
            ..Default::default()
        }
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();

        // 12:34:56 truncated to 1h window = 12:00:00
        let truncated = truncate_to_window(dt, 3600);
        assert_eq!(truncated, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());

        // Truncated to 1d window = midnight UTC
        let truncated = truncate_to_window(dt, 86400);
        assert_eq!(truncated, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        // Aligned input is unchanged
        assert_eq!(truncate_to_window(truncated, 3600), truncated);
    }

    #[test]
    fn test_hourly_rollup_scenario() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_samples(&[
                sample(7, at(1, 9, 10), 100.0, 5.000),
                sample(7, at(1, 9, 40), 120.0, 5.010),
                sample(7, at(1, 9, 55), 110.0, 5.020),
            ])
            .unwrap();

        let written = roll_up_hourly(&store, at(1, 10, 5)).unwrap();
        assert_eq!(written, 1);

        let rows = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();
        assert_eq!(rows.len(), 1);
        let b = &rows[0];
        assert_eq!(b.device_id, 7);
        assert_eq!(b.time_bucket, at(1, 9, 0));
        assert!(close(b.power.avg, 110.0));
        assert!(close(b.power.min, 100.0));
        assert!(close(b.power.max, 120.0));
        assert!(close(b.energy_start, 5.000));
        assert!(close(b.energy_end, 5.020));
        assert!(close(b.energy_consumed, 0.020));
        assert!(!b.counter_reset);
        assert_eq!(b.data_points, 3);
        assert_eq!(b.first_reading, at(1, 9, 10));
        assert_eq!(b.last_reading, at(1, 9, 55));
        assert_eq!(b.hours_active, None);
    }

    #[test]
    fn test_counter_reset_is_flagged_not_negative() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_samples(&[
                sample(7, at(1, 9, 10), 100.0, 5.000),
                sample(7, at(1, 9, 40), 120.0, 5.020),
                sample(7, at(1, 9, 55), 110.0, 0.005),
            ])
            .unwrap();

        roll_up_hourly(&store, at(1, 11, 0)).unwrap();
        let rows = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].counter_reset);
        assert_eq!(rows[0].energy_consumed, None);
        assert!(close(rows[0].energy_end, 0.005));
    }

    #[test]
    fn test_missing_counters_leave_energy_unset() {
        let mut s = sample(3, at(1, 9, 10), 50.0, 0.0);
        s.energy_total = None;
        s.voltage = None;

        let b = aggregate_samples(3, at(1, 9, 0), &[s]);
        assert_eq!(b.energy_start, None);
        assert_eq!(b.energy_consumed, None);
        assert!(!b.counter_reset);
        assert_eq!(b.voltage, Stat::default());
        assert!(close(b.power.avg, 50.0));
    }

    #[test]
    fn test_current_hour_is_not_aggregated() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_samples(&[
                sample(1, at(1, 9, 50), 10.0, 1.0),
                sample(1, at(1, 10, 5), 10.0, 1.1),
            ])
            .unwrap();

        // At 10:20 the 10:00 hour is still open
        roll_up_hourly(&store, at(1, 10, 20)).unwrap();
        let rows = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_bucket, at(1, 9, 0));

        // Once it has elapsed it is picked up
        roll_up_hourly(&store, at(1, 11, 0)).unwrap();
        let rows = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].time_bucket, at(1, 10, 0));
    }

    #[test]
    fn test_hourly_rollup_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let mut samples = Vec::new();
        for device_id in [1, 2] {
            for i in 0..12 {
                let t = at(1, 6, 0) + ChronoDuration::minutes(15 * i);
                samples.push(sample(device_id, t, 100.0 + i as f64, 2.0 + 0.01 * i as f64));
            }
        }
        store.insert_samples(&samples).unwrap();

        let now = at(1, 12, 0);
        assert_eq!(roll_up_hourly(&store, now).unwrap(), 6);
        let first = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();

        // A second run recomputes only the watermark hour, to the same values
        assert_eq!(roll_up_hourly(&store, now).unwrap(), 2);
        let second = store
            .buckets_between(Granularity::Hour, at(1, 0, 0), at(2, 0, 0))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 6);
    }

    #[test]
    fn test_no_rows_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(roll_up_hourly(&store, at(1, 12, 0)).unwrap(), 0);
        assert_eq!(roll_up_daily(&store, at(3, 0, 0)).unwrap(), 0);
        assert!(store.watermark(Granularity::Hour).unwrap().is_none());
    }

    #[test]
    fn test_daily_rollup_from_hourly() {
        let store = Store::open_in_memory().unwrap();
        let mut samples = vec![
            // Two samples in 08:00, one in 09:00
            sample(4, at(1, 8, 0), 100.0, 10.0),
            sample(4, at(1, 8, 30), 200.0, 10.5),
            sample(4, at(1, 9, 30), 400.0, 11.0),
        ];
        // Next day stays open until midnight passes
        samples.push(sample(4, at(2, 1, 0), 50.0, 12.0));
        store.insert_samples(&samples).unwrap();

        let now = at(2, 6, 0);
        roll_up_hourly(&store, now).unwrap();
        assert_eq!(roll_up_daily(&store, now).unwrap(), 1);

        let days = store
            .buckets_between(Granularity::Day, at(1, 0, 0), at(3, 0, 0))
            .unwrap();
        assert_eq!(days.len(), 1);
        let d = &days[0];
        assert_eq!(d.time_bucket, at(1, 0, 0));
        assert_eq!(d.hours_active, Some(2));
        assert_eq!(d.data_points, 3);
        // (150 * 2 + 400 * 1) / 3
        assert!(close(d.power.avg, 700.0 / 3.0));
        assert!(close(d.power.min, 100.0));
        assert!(close(d.power.max, 400.0));
        assert!(close(d.energy_start, 10.0));
        assert!(close(d.energy_end, 11.0));
        assert!(close(d.energy_consumed, 1.0));
        assert_eq!(d.first_reading, at(1, 8, 0));
        assert_eq!(d.last_reading, at(1, 9, 30));
    }

    #[test]
    fn test_daily_rollup_inherits_hourly_reset() {
        let hour = |h: u32, start: f64, end: f64, reset: bool| {
            let mut b = aggregate_samples(
                9,
                at(1, h, 0),
                &[sample(9, at(1, h, 0), 1.0, start), sample(9, at(1, h, 30), 1.0, end)],
            );
            b.counter_reset = reset;
            if reset {
                b.energy_consumed = None;
            }
            b
        };

        let flagged = aggregate_hours(9, at(1, 0, 0), &[hour(1, 1.0, 2.0, false), hour(2, 2.0, 0.1, true)]);
        assert!(flagged.counter_reset);
        assert_eq!(flagged.energy_consumed, None);

        // Drop between hours is a reset too
        let gap = aggregate_hours(9, at(1, 0, 0), &[hour(1, 4.0, 5.0, false), hour(2, 0.2, 0.4, false)]);
        assert!(gap.counter_reset);
        assert_eq!(gap.energy_consumed, None);

        let clean = aggregate_hours(9, at(1, 0, 0), &[hour(1, 4.0, 5.0, false), hour(2, 5.1, 5.4, false)]);
        assert!(!clean.counter_reset);
        assert!(close(clean.energy_consumed, 1.4));
    }
}
