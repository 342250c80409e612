//! Repository traits the pipeline components are written against.
//!
//! `Store` implements all of them on SQLite; tests can substitute their own.

use chrono::{DateTime, NaiveDate, Utc};

use super::models::*;
use super::DbError;

/// Raw telemetry: append, range reads and deletes.
pub trait TelemetryRepository {
    fn insert_samples(&self, samples: &[RawSample]) -> Result<(), DbError>;

    /// All samples with `start <= time < end`, ordered by device then time.
    fn samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError>;

    /// One device's samples with `start <= time <= end`, ordered by time.
    fn device_samples_between(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>, DbError>;

    /// Most recent sample for a device, optionally no older than `since`.
    fn latest_sample(
        &self,
        device_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<RawSample>, DbError>;

    /// Delete samples with `time < cutoff`, returning the number removed.
    fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;
}

/// Hourly and daily rollup buckets.
pub trait BucketRepository {
    /// Latest `time_bucket` present for the granularity.
    fn watermark(&self, granularity: Granularity) -> Result<Option<DateTime<Utc>>, DbError>;

    /// All buckets with `start <= time_bucket < end`, ordered by device then time.
    fn buckets_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError>;

    /// One device's buckets with `start <= time_bucket <= end`, ordered by time.
    fn device_buckets_between(
        &self,
        granularity: Granularity,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, DbError>;

    /// Insert or overwrite buckets by key in one transaction.
    fn upsert_buckets(&self, granularity: Granularity, buckets: &[Bucket])
        -> Result<usize, DbError>;

    fn delete_buckets_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError>;

    /// Reclaim free pages after deletes, or refresh planner statistics.
    fn compact(&self, reclaim: bool) -> Result<(), DbError>;
}

/// Daily consumption records and tariffs.
pub trait ConsumptionRepository {
    /// Run `decide` against the current record and active tariff for the key
    /// inside one write transaction, persisting whatever it returns.
    fn modify_consumption<F>(
        &self,
        user_id: i64,
        device_id: i64,
        day: NaiveDate,
        at: DateTime<Utc>,
        decide: F,
    ) -> Result<Option<ConsumptionRecord>, DbError>
    where
        F: FnOnce(Option<&ConsumptionRecord>, Option<&TariffRate>) -> Option<ConsumptionRecord>;

    #[cfg(test)]
    fn consumption_record(
        &self,
        user_id: i64,
        device_id: i64,
        day: NaiveDate,
    ) -> Result<Option<ConsumptionRecord>, DbError>;
}

pub trait DeviceRepository {
    fn enabled_devices(&self, user_id: i64) -> Result<Vec<Device>, DbError>;
}

/// Job-name keyed run leases.
pub trait LeaseRepository {
    /// Claim the lease unless an unexpired holder exists. Returns whether it was taken.
    fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    fn release_lease(&self, job: &str, holder: &str) -> Result<(), DbError>;
}
