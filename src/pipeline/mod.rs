//! Batch pipeline: hourly rollup, daily rollup, then retention.
//!
//! One run holds the job lease for its whole duration. A step failure stops
//! the run before any later step, so retention never deletes rows that a
//! failed rollup did not cover.

mod lease;
mod retention;
mod rollup;

pub use lease::*;
pub use retention::*;
pub use rollup::*;

use crate::config::Config;
use crate::db::{BucketRepository, DbError, LeaseRepository, TelemetryRepository};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Instant;

/// Lease key shared by every invocation of the pipeline.
pub const PIPELINE_JOB: &str = "rollup-pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Another run held the lease; nothing was touched.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Lease,
    HourlyRollup,
    DailyRollup,
    Retention,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub step: Step,
    pub message: String,
}

/// Structured summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job: &'static str,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub hourly_buckets: usize,
    pub daily_buckets: usize,
    pub retention: Option<RetentionReport>,
    pub errors: Vec<StepError>,
}

impl RunReport {
    fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            job: PIPELINE_JOB,
            run_id,
            status: RunStatus::Completed,
            started_at,
            duration_ms: 0,
            hourly_buckets: 0,
            daily_buckets: 0,
            retention: None,
            errors: Vec::new(),
        }
    }

    fn fail(&mut self, step: Step, err: &DbError) {
        tracing::error!("Pipeline: {:?} failed in run {}: {}", step, self.run_id, err);
        self.status = RunStatus::Failed;
        self.errors.push(StepError {
            step,
            message: err.to_string(),
        });
    }

    fn finish(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// The scheduled rollup and retention job.
#[derive(Clone)]
pub struct Pipeline<S> {
    store: S,
    policy: RetentionPolicy,
    lease_ttl: ChronoDuration,
}

impl<S> Pipeline<S>
where
    S: TelemetryRepository + BucketRepository + LeaseRepository,
{
    pub fn new(store: S, cfg: &Config) -> Self {
        Self {
            store,
            policy: RetentionPolicy::from(cfg),
            lease_ttl: ChronoDuration::seconds(cfg.lease_ttl_secs),
        }
    }

    /// Run every step once, in order, under the job lease.
    pub fn run(&self, now: DateTime<Utc>) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(new_run_id(), now);

        let lease = match LeaseGuard::acquire(
            &self.store,
            PIPELINE_JOB,
            &report.run_id,
            now,
            self.lease_ttl,
        ) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!("Pipeline: another run holds {}, skipping", PIPELINE_JOB);
                report.status = RunStatus::Skipped;
                return report.finish(started);
            }
            Err(e) => {
                report.fail(Step::Lease, &e);
                return report.finish(started);
            }
        };

        tracing::debug!("Pipeline: run {} holds {}", lease.holder(), PIPELINE_JOB);

        match roll_up_hourly(&self.store, now) {
            Ok(n) => report.hourly_buckets = n,
            Err(e) => {
                report.fail(Step::HourlyRollup, &e);
                return report.finish(started);
            }
        }

        match roll_up_daily(&self.store, now) {
            Ok(n) => report.daily_buckets = n,
            Err(e) => {
                report.fail(Step::DailyRollup, &e);
                return report.finish(started);
            }
        }

        match enforce_retention(&self.store, &self.policy, now) {
            Ok(r) => report.retention = Some(r),
            Err(e) => report.fail(Step::Retention, &e),
        }

        drop(lease);
        let report = report.finish(started);
        tracing::info!(
            "Pipeline: run {} {:?} in {}ms ({} hourly, {} daily buckets)",
            report.run_id,
            report.status,
            report.duration_ms,
            report.hourly_buckets,
            report.daily_buckets
        );
        report
    }
}

fn new_run_id() -> String {
    format!("{}-{:08x}", std::process::id(), rand::random::<u32>())
}
