//! Daily consumption and cost derived from device energy counters.
//!
//! Each reading is compared against the stored record for the device's
//! current day inside one write transaction. Changes at or below the
//! anti-thrash delta are treated as measurement noise and not persisted.

use crate::config::Config;
use crate::db::{ConsumptionRecord, ConsumptionRepository, DbError, TariffRate};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Settings read from configuration at start-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostSettings {
    /// Minimum consumption change in kWh that is written back.
    pub delta_kwh: f64,
    /// Price per kWh for users without any tariff.
    pub fallback_rate: f64,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            delta_kwh: 0.001,
            fallback_rate: 0.32,
        }
    }
}

impl From<&Config> for CostSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            delta_kwh: cfg.consumption_delta_kwh,
            fallback_rate: cfg.fallback_rate,
        }
    }
}

/// What a reading did to the day's consumption record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ReadingOutcome {
    Created(ConsumptionRecord),
    Updated(ConsumptionRecord),
    /// Change too small to persist.
    Ignored { delta: f64 },
    /// No usable consumption in the reading.
    Skipped,
}

/// Fold one energy reading into the device's consumption record for the day of `now`.
pub fn apply_reading<S: ConsumptionRepository>(
    store: &S,
    settings: &CostSettings,
    user_id: i64,
    device_id: i64,
    energy_today: Option<f64>,
    energy_total: Option<f64>,
    now: DateTime<Utc>,
) -> Result<ReadingOutcome, DbError> {
    let Some(today) = energy_today.filter(|v| v.is_finite()) else {
        return Ok(ReadingOutcome::Skipped);
    };
    let meter_value = energy_total.filter(|v| v.is_finite()).unwrap_or(today);

    let mut outcome = ReadingOutcome::Skipped;
    store.modify_consumption(user_id, device_id, now.date_naive(), now, |existing, tariff| {
        let (rate, fallback) = resolve_rate(tariff, settings.fallback_rate);

        match existing {
            None if today > 0.0 => {
                if fallback {
                    tracing::debug!(
                        "Metering: no tariff for user {}, using fallback rate {}",
                        user_id,
                        rate
                    );
                }
                let record = ConsumptionRecord {
                    user_id,
                    device_id,
                    day: now.date_naive(),
                    meter_value,
                    consumption_kwh: today,
                    cost: today * rate,
                    rate_per_kwh: rate,
                    fallback_rate: fallback,
                    created_at: now,
                    updated_at: now,
                };
                outcome = ReadingOutcome::Created(record.clone());
                Some(record)
            }
            None => None,
            Some(current) => {
                let delta = (today - current.consumption_kwh).abs();
                if delta <= settings.delta_kwh {
                    outcome = ReadingOutcome::Ignored { delta };
                    return None;
                }

                let record = ConsumptionRecord {
                    meter_value,
                    consumption_kwh: today,
                    cost: today * rate,
                    rate_per_kwh: rate,
                    fallback_rate: fallback,
                    updated_at: now,
                    ..current.clone()
                };
                outcome = ReadingOutcome::Updated(record.clone());
                Some(record)
            }
        }
    })?;

    Ok(outcome)
}

/// Active tariff, or the fallback rate flagged as such.
fn resolve_rate(tariff: Option<&TariffRate>, fallback_rate: f64) -> (f64, bool) {
    match tariff {
        Some(t) => (t.rate_per_kwh, false),
        None => (fallback_rate, true),
    }
}
