//! Database model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A metered device belonging to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Configured nominal wattage, if known.
    pub wattage: Option<f64>,
    pub enabled: bool,
}

/// A single raw telemetry sample. Absent fields stay `None`, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub device_id: i64,
    pub user_id: i64,
    pub time: DateTime<Utc>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub apparent_power: Option<f64>,
    pub reactive_power: Option<f64>,
    pub power_factor: Option<f64>,
    pub energy_today: Option<f64>,
    pub energy_yesterday: Option<f64>,
    /// Cumulative counter in kWh.
    pub energy_total: Option<f64>,
}

/// Width of a rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn table(self) -> &'static str {
        match self {
            Granularity::Hour => "hourly_buckets",
            Granularity::Day => "daily_buckets",
        }
    }

    pub fn window_seconds(self) -> i64 {
        match self {
            Granularity::Hour => 3600,
            Granularity::Day => 86400,
        }
    }
}

/// Min/avg/max of one measurement over a bucket. All `None` when the
/// bucket saw no value for the measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// An aggregated row for one device and one hour or day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub granularity: Granularity,
    pub device_id: i64,
    pub user_id: i64,
    /// Start of the window, aligned to the granularity.
    pub time_bucket: DateTime<Utc>,
    pub voltage: Stat,
    pub current: Stat,
    pub power: Stat,
    pub power_factor: Stat,
    pub energy_start: Option<f64>,
    pub energy_end: Option<f64>,
    /// `None` when the counter reset inside the window or was never reported.
    pub energy_consumed: Option<f64>,
    pub counter_reset: bool,
    pub data_points: i64,
    pub first_reading: DateTime<Utc>,
    pub last_reading: DateTime<Utc>,
    /// Number of contributing hourly buckets; only set on daily rows.
    pub hours_active: Option<i64>,
}

/// Daily consumption and cost for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub user_id: i64,
    pub device_id: i64,
    pub day: NaiveDate,
    pub meter_value: f64,
    pub consumption_kwh: f64,
    pub cost: f64,
    pub rate_per_kwh: f64,
    /// True when no tariff was configured and the fallback rate was used.
    pub fallback_rate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's price per kWh, effective from `valid_from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffRate {
    pub user_id: i64,
    pub rate_per_kwh: f64,
    pub valid_from: DateTime<Utc>,
}

/// Row counts and watermarks for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub db_size_bytes: i64,
    pub page_count: i64,
    pub page_size: i64,
    pub freelist_count: i64,
    pub raw_samples: i64,
    pub hourly_buckets: i64,
    pub daily_buckets: i64,
    pub consumption_records: i64,
    pub hourly_watermark: Option<DateTime<Utc>>,
    pub daily_watermark: Option<DateTime<Utc>>,
}
