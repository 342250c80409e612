//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{
    params, Connection, OptionalExtension, Result as SqlResult, Row, TransactionBehavior,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::repo::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Schema migrations, applied in order on open. Each one is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[
    ("000001_init", include_str!("../../migrations/000001_init.up.sql")),
    ("000002_buckets", include_str!("../../migrations/000002_buckets.up.sql")),
    ("000003_consumption", include_str!("../../migrations/000003_consumption.up.sql")),
    ("000004_job_leases", include_str!("../../migrations/000004_job_leases.up.sql")),
];

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DB_DAY_FORMAT: &str = "%Y-%m-%d";

const SAMPLE_COLUMNS: &str = "device_id, user_id, time, voltage, current, power, \
     apparent_power, reactive_power, power_factor, energy_today, energy_yesterday, energy_total";

const BUCKET_COLUMNS: &str = "device_id, user_id, time_bucket, \
     avg_voltage, min_voltage, max_voltage, avg_current, min_current, max_current, \
     avg_power, min_power, max_power, avg_power_factor, min_power_factor, max_power_factor, \
     energy_start, energy_end, energy_consumed, counter_reset, data_points, \
     first_reading, last_reading, hours_active";

const CONSUMPTION_COLUMNS: &str = "user_id, device_id, day, meter_value, consumption_kwh, \
     cost, rate_per_kwh, fallback_rate, created_at, updated_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a private in-memory store.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Create any missing tables.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        for (name, sql) in MIGRATIONS {
            conn.execute_batch(sql)
                .map_err(|e| DbError::Migration(format!("{} failed: {}", name, e)))?;
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Devices & tariffs ---

    /// Insert or replace a device.
    pub fn upsert_device(&self, device: &Device) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (id, user_id, name, wattage, enabled) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
             user_id=excluded.user_id, name=excluded.name, wattage=excluded.wattage, enabled=excluded.enabled",
            params![device.id, device.user_id, device.name, device.wattage, device.enabled],
        )?;
        Ok(())
    }

    /// Add a tariff rate for a user.
    pub fn add_tariff_rate(&self, rate: &TariffRate) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tariff_rates (user_id, rate_per_kwh, valid_from) VALUES (?1, ?2, ?3)",
            params![rate.user_id, rate.rate_per_kwh, fmt_db_time(rate.valid_from)],
        )?;
        Ok(())
    }

    // --- Status Page Stats ---

    /// Collect page-level and per-tier statistics.
    pub fn storage_stats(&self) -> Result<StorageStats, DbError> {
        let (page_count, page_size, freelist_count, raw, hourly, daily, consumption) = {
            let conn = self.conn()?;
            let pragma = |name: &str| -> SqlResult<i64> {
                conn.query_row(&format!("PRAGMA {}", name), [], |r| r.get(0))
            };
            let count = |table: &str| -> SqlResult<i64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            };
            (
                pragma("page_count")?,
                pragma("page_size")?,
                pragma("freelist_count")?,
                count("raw_samples")?,
                count(Granularity::Hour.table())?,
                count(Granularity::Day.table())?,
                count("consumption_records")?,
            )
        };

        Ok(StorageStats {
            db_size_bytes: page_count * page_size,
            page_count,
            page_size,
            freelist_count,
            raw_samples: raw,
            hourly_buckets: hourly,
            daily_buckets: daily,
            consumption_records: consumption,
            hourly_watermark: self.watermark(Granularity::Hour)?,
            daily_watermark: self.watermark(Granularity::Day)?,
        })
    }
}

impl TelemetryRepository for Store {
    fn insert_samples(&self, samples: &[RawSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO raw_samples ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                SAMPLE_COLUMNS
            ))?;

            for s in samples {
                stmt.execute(params![
                    s.device_id,
                    s.user_id,
                    fmt_db_time(s.time),
                    s.voltage,
                    s.current,
                    s.power,
                    s.apparent_power,
                    s.reactive_power,
                    s.power_factor,
                    s.energy_today,
                    s.energy_yesterday,
                    s.energy_total,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM raw_samples WHERE time >= ?1 AND time < ?2 ORDER BY device_id ASC, time ASC",
            SAMPLE_COLUMNS
        ))?;

        let samples = stmt
            .query_map(params![fmt_db_time(start), fmt_db_time(end)], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    fn device_samples_between(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM raw_samples WHERE device_id = ?1 AND time >= ?2 AND time <= ?3 ORDER BY time ASC",
            SAMPLE_COLUMNS
        ))?;

        let samples = stmt
            .query_map(
                params![device_id, fmt_db_time(start), fmt_db_time(end)],
                sample_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    fn latest_sample(
        &self,
        device_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<RawSample>, DbError> {
        let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let conn = self.conn()?;
        let sample = conn
            .query_row(
                &format!(
                    "SELECT {} FROM raw_samples WHERE device_id = ?1 AND time >= ?2 ORDER BY time DESC LIMIT 1",
                    SAMPLE_COLUMNS
                ),
                params![device_id, fmt_db_time(since)],
                sample_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM raw_samples WHERE time < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

impl BucketRepository for Store {
    fn watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            &format!("SELECT MAX(time_bucket) FROM {}", granularity.table()),
            [],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    fn buckets_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE time_bucket >= ?1 AND time_bucket < ?2
             ORDER BY device_id ASC, time_bucket ASC",
            BUCKET_COLUMNS,
            granularity.table()
        ))?;

        let buckets = stmt
            .query_map(params![fmt_db_time(start), fmt_db_time(end)], |row| {
                bucket_from_row(row, granularity)
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }

    fn device_buckets_between(
        &self,
        granularity: Granularity,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE device_id = ?1 AND time_bucket >= ?2 AND time_bucket <= ?3
             ORDER BY time_bucket ASC",
            BUCKET_COLUMNS,
            granularity.table()
        ))?;

        let buckets = stmt
            .query_map(
                params![device_id, fmt_db_time(start), fmt_db_time(end)],
                |row| bucket_from_row(row, granularity),
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }

    fn upsert_buckets(
        &self,
        granularity: Granularity,
        buckets: &[Bucket],
    ) -> Result<usize, DbError> {
        if buckets.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                 ON CONFLICT(device_id, time_bucket) DO UPDATE SET
                 user_id=excluded.user_id,
                 avg_voltage=excluded.avg_voltage, min_voltage=excluded.min_voltage, max_voltage=excluded.max_voltage,
                 avg_current=excluded.avg_current, min_current=excluded.min_current, max_current=excluded.max_current,
                 avg_power=excluded.avg_power, min_power=excluded.min_power, max_power=excluded.max_power,
                 avg_power_factor=excluded.avg_power_factor, min_power_factor=excluded.min_power_factor,
                 max_power_factor=excluded.max_power_factor,
                 energy_start=excluded.energy_start, energy_end=excluded.energy_end,
                 energy_consumed=excluded.energy_consumed, counter_reset=excluded.counter_reset,
                 data_points=excluded.data_points, first_reading=excluded.first_reading,
                 last_reading=excluded.last_reading, hours_active=excluded.hours_active",
                granularity.table(),
                BUCKET_COLUMNS
            ))?;

            for b in buckets {
                stmt.execute(params![
                    b.device_id,
                    b.user_id,
                    fmt_db_time(b.time_bucket),
                    b.voltage.avg,
                    b.voltage.min,
                    b.voltage.max,
                    b.current.avg,
                    b.current.min,
                    b.current.max,
                    b.power.avg,
                    b.power.min,
                    b.power.max,
                    b.power_factor.avg,
                    b.power_factor.min,
                    b.power_factor.max,
                    b.energy_start,
                    b.energy_end,
                    b.energy_consumed,
                    b.counter_reset,
                    b.data_points,
                    fmt_db_time(b.first_reading),
                    fmt_db_time(b.last_reading),
                    b.hours_active,
                ])?;
            }
        }

        tx.commit()?;
        Ok(buckets.len())
    }

    fn delete_buckets_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE time_bucket < ?1", granularity.table()),
            params![fmt_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    fn compact(&self, reclaim: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        if reclaim {
            conn.execute_batch("VACUUM")?;
        } else {
            conn.execute_batch("PRAGMA optimize")?;
        }
        Ok(())
    }
}

impl ConsumptionRepository for Store {
    fn modify_consumption<F>(
        &self,
        user_id: i64,
        device_id: i64,
        day: NaiveDate,
        at: DateTime<Utc>,
        decide: F,
    ) -> Result<Option<ConsumptionRecord>, DbError>
    where
        F: FnOnce(Option<&ConsumptionRecord>, Option<&TariffRate>) -> Option<ConsumptionRecord>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = query_consumption(&tx, user_id, device_id, day)?;
        let tariff = query_active_tariff(&tx, user_id, at)?;

        let decided = decide(existing.as_ref(), tariff.as_ref());
        if let Some(r) = &decided {
            tx.execute(
                &format!(
                    "INSERT INTO consumption_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(user_id, device_id, day) DO UPDATE SET
                     meter_value=excluded.meter_value, consumption_kwh=excluded.consumption_kwh,
                     cost=excluded.cost, rate_per_kwh=excluded.rate_per_kwh,
                     fallback_rate=excluded.fallback_rate, updated_at=excluded.updated_at",
                    CONSUMPTION_COLUMNS
                ),
                params![
                    r.user_id,
                    r.device_id,
                    r.day.format(DB_DAY_FORMAT).to_string(),
                    r.meter_value,
                    r.consumption_kwh,
                    r.cost,
                    r.rate_per_kwh,
                    r.fallback_rate,
                    fmt_db_time(r.created_at),
                    fmt_db_time(r.updated_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(decided)
    }

    #[cfg(test)]
    fn consumption_record(
        &self,
        user_id: i64,
        device_id: i64,
        day: NaiveDate,
    ) -> Result<Option<ConsumptionRecord>, DbError> {
        let conn = self.conn()?;
        query_consumption(&conn, user_id, device_id, day)
    }
}

impl DeviceRepository for Store {
    fn enabled_devices(&self, user_id: i64) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, wattage, enabled FROM devices
             WHERE user_id = ?1 AND enabled = 1 ORDER BY id ASC",
        )?;

        let devices = stmt
            .query_map(params![user_id], |row| {
                Ok(Device {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    wattage: row.get(3)?,
                    enabled: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }
}

impl LeaseRepository for Store {
    fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM job_leases WHERE job_name = ?1 AND expires_at <= ?2",
            params![job, fmt_db_time(now)],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO job_leases (job_name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job, holder, fmt_db_time(now), fmt_db_time(expires_at)],
        )?;

        tx.commit()?;
        Ok(inserted == 1)
    }

    fn release_lease(&self, job: &str, holder: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM job_leases WHERE job_name = ?1 AND holder = ?2",
            params![job, holder],
        )?;
        Ok(())
    }
}

fn query_consumption(
    conn: &Connection,
    user_id: i64,
    device_id: i64,
    day: NaiveDate,
) -> Result<Option<ConsumptionRecord>, DbError> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM consumption_records WHERE user_id = ?1 AND device_id = ?2 AND day = ?3",
                CONSUMPTION_COLUMNS
            ),
            params![user_id, device_id, day.format(DB_DAY_FORMAT).to_string()],
            |row| {
                Ok(ConsumptionRecord {
                    user_id: row.get(0)?,
                    device_id: row.get(1)?,
                    day: day_col(row, 2)?,
                    meter_value: row.get(3)?,
                    consumption_kwh: row.get(4)?,
                    cost: row.get(5)?,
                    rate_per_kwh: row.get(6)?,
                    fallback_rate: row.get(7)?,
                    created_at: time_col(row, 8)?,
                    updated_at: time_col(row, 9)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn query_active_tariff(
    conn: &Connection,
    user_id: i64,
    at: DateTime<Utc>,
) -> Result<Option<TariffRate>, DbError> {
    let rate = conn
        .query_row(
            "SELECT user_id, rate_per_kwh, valid_from FROM tariff_rates
             WHERE user_id = ?1 AND valid_from <= ?2
             ORDER BY valid_from DESC, id DESC LIMIT 1",
            params![user_id, fmt_db_time(at)],
            |row| {
                Ok(TariffRate {
                    user_id: row.get(0)?,
                    rate_per_kwh: row.get(1)?,
                    valid_from: time_col(row, 2)?,
                })
            },
        )
        .optional()?;
    Ok(rate)
}

fn sample_from_row(row: &Row<'_>) -> SqlResult<RawSample> {
    Ok(RawSample {
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        time: time_col(row, 2)?,
        voltage: row.get(3)?,
        current: row.get(4)?,
        power: row.get(5)?,
        apparent_power: row.get(6)?,
        reactive_power: row.get(7)?,
        power_factor: row.get(8)?,
        energy_today: row.get(9)?,
        energy_yesterday: row.get(10)?,
        energy_total: row.get(11)?,
    })
}

fn bucket_from_row(row: &Row<'_>, granularity: Granularity) -> SqlResult<Bucket> {
    let stat = |i: usize| -> SqlResult<Stat> {
        Ok(Stat {
            avg: row.get(i)?,
            min: row.get(i + 1)?,
            max: row.get(i + 2)?,
        })
    };

    Ok(Bucket {
        granularity,
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        time_bucket: time_col(row, 2)?,
        voltage: stat(3)?,
        current: stat(6)?,
        power: stat(9)?,
        power_factor: stat(12)?,
        energy_start: row.get(15)?,
        energy_end: row.get(16)?,
        energy_consumed: row.get(17)?,
        counter_reset: row.get(18)?,
        data_points: row.get(19)?,
        first_reading: time_col(row, 20)?,
        last_reading: time_col(row, 21)?,
        hours_active: row.get(22)?,
    })
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparseable timestamp {:?}", s).into(),
        )
    })
}

fn day_col(row: &Row<'_>, idx: usize) -> SqlResult<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DB_DAY_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Format a timestamp the way every time column is stored.
pub fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
