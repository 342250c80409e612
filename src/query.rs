//! Read path: chart series and live device snapshots.
//!
//! Read-only; takes no lease and never waits on the batch pipeline.

use crate::config::StatusThresholds;
use crate::db::{
    Bucket, BucketRepository, DbError, DeviceRepository, Granularity, RawSample,
    TelemetryRepository,
};
use crate::pipeline::{aggregate_samples, truncate_to_window, RetentionPolicy};
use crate::status::{DeviceStatus, Status};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Query error types.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("device id must be a positive integer, got {0}")]
    InvalidDevice(i64),
    #[error("unknown metric {0:?}, expected power, voltage, current or energy")]
    InvalidMetric(String),
    #[error("time range of {0} minutes is out of bounds")]
    InvalidRange(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Measurement a chart plots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Power,
    Voltage,
    Current,
    Energy,
}

impl FromStr for Metric {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "power" => Ok(Metric::Power),
            "voltage" => Ok(Metric::Voltage),
            "current" => Ok(Metric::Current),
            "energy" => Ok(Metric::Energy),
            other => Err(QueryError::InvalidMetric(other.to_string())),
        }
    }
}

impl Metric {
    pub fn unit(self) -> &'static str {
        match self {
            Metric::Power => "W",
            Metric::Voltage => "V",
            Metric::Current => "A",
            Metric::Energy => "kWh",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::Power => "Power",
            Metric::Voltage => "Voltage",
            Metric::Current => "Current",
            Metric::Energy => "Energy",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Metric::Power => "#f59e0b",
            Metric::Voltage => "#3b82f6",
            Metric::Current => "#10b981",
            Metric::Energy => "#8b5cf6",
        }
    }

    fn of_sample(self, s: &RawSample) -> Option<f64> {
        match self {
            Metric::Power => s.power,
            Metric::Voltage => s.voltage,
            Metric::Current => s.current,
            Metric::Energy => s.energy_total,
        }
    }

    fn of_bucket(self, b: &Bucket) -> Option<f64> {
        match self {
            Metric::Power => b.power.avg,
            Metric::Voltage => b.voltage.avg,
            Metric::Current => b.current.avg,
            Metric::Energy => b.energy_end,
        }
    }
}

/// Source table a series was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Raw,
    Hourly,
    Daily,
}

/// Parallel label/value arrays for charting.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSeries {
    pub device_id: i64,
    pub metric: Metric,
    pub unit: &'static str,
    pub label: &'static str,
    pub color: &'static str,
    pub resolution: Resolution,
    pub labels: Vec<String>,
    pub data: Vec<Option<f64>>,
    pub count: usize,
    /// Most recent sample in the range, for the "current value" display.
    pub current: Option<RawSample>,
}

const RAW_RANGE_MINUTES: i64 = 24 * 60;
const MONTH_MINUTES: i64 = 31 * 24 * 60;

fn resolution_for(range_minutes: i64, policy: &RetentionPolicy) -> Resolution {
    let hourly_minutes = policy.hourly_months as i64 * MONTH_MINUTES;
    if range_minutes <= RAW_RANGE_MINUTES {
        Resolution::Raw
    } else if range_minutes <= hourly_minutes {
        Resolution::Hourly
    } else {
        Resolution::Daily
    }
}

fn label_format(range_minutes: i64) -> &'static str {
    if range_minutes <= RAW_RANGE_MINUTES {
        "%H:%M"
    } else if range_minutes <= MONTH_MINUTES {
        "%d.%m %H:%M"
    } else {
        "%d.%m.%Y"
    }
}

/// Series of one metric for a device over the last `range_minutes`.
///
/// Ranges beyond a day are served from hourly or daily buckets. Hourly
/// series are completed with raw hours the pipeline has not rolled up yet.
pub fn chart_series<S>(
    store: &S,
    policy: &RetentionPolicy,
    device_id: i64,
    metric: Metric,
    range_minutes: i64,
    now: DateTime<Utc>,
) -> Result<ChartSeries, QueryError>
where
    S: TelemetryRepository + BucketRepository,
{
    if device_id <= 0 {
        return Err(QueryError::InvalidDevice(device_id));
    }

    let range_minutes = range_minutes.max(1);
    let start = ChronoDuration::try_minutes(range_minutes)
        .and_then(|range| now.checked_sub_signed(range))
        .ok_or(QueryError::InvalidRange(range_minutes))?;
    let fmt = label_format(range_minutes);
    let resolution = resolution_for(range_minutes, policy);

    let (points, current): (Vec<(DateTime<Utc>, Option<f64>)>, Option<RawSample>) = match resolution {
        Resolution::Raw => {
            let samples = store.device_samples_between(device_id, start, now)?;
            let points = samples.iter().map(|s| (s.time, metric.of_sample(s))).collect();
            (points, samples.last().cloned())
        }
        Resolution::Hourly | Resolution::Daily => {
            let granularity = if resolution == Resolution::Hourly {
                Granularity::Hour
            } else {
                Granularity::Day
            };
            let mut buckets = store.device_buckets_between(granularity, device_id, start, now)?;
            if granularity == Granularity::Hour {
                let tail = unrolled_hours(store, device_id, start, now, buckets.last())?;
                buckets.extend(tail);
            }
            let points = buckets
                .iter()
                .map(|b| (b.time_bucket, metric.of_bucket(b)))
                .collect();
            (points, store.latest_sample(device_id, Some(start))?)
        }
    };

    let (labels, data): (Vec<String>, Vec<Option<f64>>) = points
        .into_iter()
        .map(|(t, v)| (t.format(fmt).to_string(), v))
        .unzip();

    Ok(ChartSeries {
        device_id,
        metric,
        unit: metric.unit(),
        label: metric.label(),
        color: metric.color(),
        resolution,
        count: data.len(),
        labels,
        data,
        current,
    })
}

/// Hourly aggregates of raw samples newer than the device's last stored
/// hourly bucket. The current, still open hour is included.
fn unrolled_hours<S: TelemetryRepository>(
    store: &S,
    device_id: i64,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    last_stored: Option<&Bucket>,
) -> Result<Vec<Bucket>, DbError> {
    let hour = Granularity::Hour.window_seconds();
    let tail_start = match last_stored {
        Some(b) => (b.time_bucket + ChronoDuration::seconds(hour)).max(start),
        None => start,
    };

    let mut hours: BTreeMap<DateTime<Utc>, Vec<RawSample>> = BTreeMap::new();
    for s in store.device_samples_between(device_id, tail_start, now)? {
        hours.entry(truncate_to_window(s.time, hour)).or_default().push(s);
    }

    Ok(hours
        .into_iter()
        .map(|(bucket_start, samples)| aggregate_samples(device_id, bucket_start, &samples))
        .collect())
}

/// Latest measured values shown next to a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentReading {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub power_factor: Option<f64>,
    pub energy_today: Option<f64>,
    pub energy_total: Option<f64>,
}

impl From<&RawSample> for CurrentReading {
    fn from(s: &RawSample) -> Self {
        Self {
            voltage: s.voltage,
            current: s.current,
            power: s.power,
            power_factor: s.power_factor,
            energy_today: s.energy_today,
            energy_total: s.energy_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveDevice {
    pub name: String,
    pub wattage: Option<f64>,
    pub status: Status,
    /// Last-known sample time, even when outside the status lookback.
    pub last_update: Option<DateTime<Utc>>,
    pub minutes_ago: Option<i64>,
    pub power: Option<f64>,
    pub reading: Option<CurrentReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceError {
    pub device_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveSnapshot {
    pub devices: BTreeMap<i64, LiveDevice>,
    pub errors: Vec<DeviceError>,
}

/// Status and latest values of every enabled device a user owns.
///
/// A failure reading one device is reported in `errors` and that device is
/// listed as unknown; the rest of the snapshot is still served.
pub fn live_snapshot<S>(
    store: &S,
    thresholds: &StatusThresholds,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<LiveSnapshot, QueryError>
where
    S: DeviceRepository + TelemetryRepository,
{
    let mut snapshot = LiveSnapshot::default();

    for device in store.enabled_devices(user_id)? {
        let entry = match live_device(store, thresholds, &device, now) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Query: live status failed for device {}: {}", device.id, e);
                snapshot.errors.push(DeviceError {
                    device_id: device.id,
                    message: e.to_string(),
                });
                LiveDevice {
                    name: device.name.clone(),
                    wattage: device.wattage,
                    status: Status::Unknown,
                    last_update: None,
                    minutes_ago: None,
                    power: None,
                    reading: None,
                }
            }
        };
        snapshot.devices.insert(device.id, entry);
    }

    Ok(snapshot)
}

fn live_device<S: TelemetryRepository>(
    store: &S,
    thresholds: &StatusThresholds,
    device: &crate::db::Device,
    now: DateTime<Utc>,
) -> Result<LiveDevice, DbError> {
    let since = now - ChronoDuration::minutes(thresholds.lookback_minutes);
    let recent = store.latest_sample(device.id, Some(since))?;
    let status = DeviceStatus::evaluate(device.id, recent.as_ref().map(|s| s.time), now, thresholds);

    let last_update = match &recent {
        Some(s) => Some(s.time),
        None => store.latest_sample(device.id, None)?.map(|s| s.time),
    };

    Ok(LiveDevice {
        name: device.name.clone(),
        wattage: device.wattage,
        status: status.status,
        last_update,
        minutes_ago: last_update.map(|t| (now - t).num_minutes().max(0)),
        power: recent.as_ref().and_then(|s| s.power),
        reading: recent.as_ref().map(CurrentReading::from),
    })
}
