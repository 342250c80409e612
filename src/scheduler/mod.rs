//! Serve-mode background work: buffered sample ingest and periodic pipeline runs.

use crate::config::Config;
use crate::db::{ConsumptionRepository, RawSample, Store, TelemetryRepository};
use crate::metering::{apply_reading, CostSettings};
use crate::pipeline::{Pipeline, RunReport};
use crate::query::DeviceError;

use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_THRESHOLD: usize = 500;
const MAX_RETAINED: usize = 20 * FLUSH_THRESHOLD;

/// Owns the ingest channel and the pipeline timer.
pub struct Scheduler {
    pipeline: Pipeline<Store>,
    sample_tx: mpsc::Sender<RawSample>,
    interval: Duration,
}

impl Scheduler {
    /// Create a scheduler and start its batch writer. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Store, cfg: &Config) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        tokio::spawn(run_batch_writer(rx, store.clone(), CostSettings::from(cfg)));

        Self {
            pipeline: Pipeline::new(store, cfg),
            sample_tx: tx,
            interval: Duration::from_secs(cfg.pipeline_interval_secs.max(1)),
        }
    }

    /// Queue a sample for the next flush.
    pub async fn submit(&self, sample: RawSample) -> Result<(), mpsc::error::SendError<RawSample>> {
        self.sample_tx.send(sample).await
    }

    /// Run the pipeline every configured interval, starting immediately.
    pub fn start(&self) {
        let pipeline = self.pipeline.clone();
        let period = self.interval;

        tracing::info!("Scheduler: running pipeline every {}s", period.as_secs());

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                match run_blocking(pipeline.clone()).await {
                    Ok(report) if report.is_failed() => {
                        tracing::warn!("Scheduler: run {} failed: {:?}", report.run_id, report.errors)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Scheduler: pipeline task panicked: {}", e),
                }
            }
        });
    }

    /// Run the pipeline once, off the async executor.
    pub async fn run_pipeline(&self) -> Result<RunReport, JoinError> {
        run_blocking(self.pipeline.clone()).await
    }
}

async fn run_blocking(pipeline: Pipeline<Store>) -> Result<RunReport, JoinError> {
    tokio::task::spawn_blocking(move || pipeline.run(Utc::now())).await
}

/// Accumulate submitted samples and flush them every two seconds or once
/// the buffer is full.
async fn run_batch_writer(mut rx: mpsc::Receiver<RawSample>, store: Store, settings: CostSettings) {
    let mut buffer: Vec<RawSample> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&store, &settings, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        let summary = flush_buffer(&store, &settings, &mut buffer);
                        if summary.retained > 0 {
                            tracing::error!("Ingest: {} samples not persisted at shutdown", summary.retained);
                        }
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &settings, &mut buffer);
            }
        }
    }
}

/// Outcome of one buffer flush.
#[derive(Debug, Default)]
pub struct FlushSummary {
    pub written: usize,
    /// Samples kept for the next flush after a failed insert.
    pub retained: usize,
    pub errors: Vec<DeviceError>,
}

/// Persist buffered samples, then fold each one into its day's consumption.
///
/// A failed insert keeps the buffer (up to `MAX_RETAINED` samples, oldest
/// dropped first) for the next flush. A failing device is collected into
/// `errors`; the rest of the batch proceeds.
fn flush_buffer<S>(store: &S, settings: &CostSettings, buffer: &mut Vec<RawSample>) -> FlushSummary
where
    S: TelemetryRepository + ConsumptionRepository,
{
    let mut summary = FlushSummary::default();
    if buffer.is_empty() {
        return summary;
    }

    if let Err(e) = store.insert_samples(buffer) {
        if buffer.len() > MAX_RETAINED {
            let dropped = buffer.len() - MAX_RETAINED;
            buffer.drain(..dropped);
            tracing::error!("Ingest: dropped {} oldest samples after repeated flush failures", dropped);
        }
        tracing::error!("Ingest: failed to flush {} samples, will retry: {}", buffer.len(), e);
        summary.retained = buffer.len();
        return summary;
    }

    for s in buffer.iter() {
        if let Err(e) = apply_reading(
            store,
            settings,
            s.user_id,
            s.device_id,
            s.energy_today,
            s.energy_total,
            s.time,
        ) {
            tracing::warn!("Metering: device {} reading not applied: {}", s.device_id, e);
            summary.errors.push(DeviceError {
                device_id: s.device_id,
                message: e.to_string(),
            });
        }
    }

    summary.written = buffer.len();
    tracing::debug!(
        "Ingest: flushed {} samples ({} metering failures)",
        summary.written,
        summary.errors.len()
    );
    buffer.clear();
    summary
}
