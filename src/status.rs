//! Device liveness from the age of its latest sample.

use crate::config::StatusThresholds;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Warning,
    Offline,
    Unknown,
}

/// Derived liveness of one device. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_id: i64,
    pub status: Status,
    /// Whole minutes since the last sample inside the lookback.
    pub minutes_since_last_sample: Option<i64>,
}

/// Classify a device by the timestamp of its latest sample.
///
/// Samples older than the lookback window count as absent.
pub fn classify(
    last_sample: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &StatusThresholds,
) -> (Status, Option<i64>) {
    let Some(last) = last_sample else {
        return (Status::Unknown, None);
    };

    // Clock skew can put the sample slightly in the future
    let minutes = (now - last).num_minutes().max(0);
    if minutes > thresholds.lookback_minutes {
        return (Status::Unknown, None);
    }

    let status = if minutes <= thresholds.online_minutes {
        Status::Online
    } else if minutes <= thresholds.warning_minutes {
        Status::Warning
    } else {
        Status::Offline
    };
    (status, Some(minutes))
}

impl DeviceStatus {
    pub fn evaluate(
        device_id: i64,
        last_sample: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        thresholds: &StatusThresholds,
    ) -> Self {
        let (status, minutes_since_last_sample) = classify(last_sample, now, thresholds);
        Self {
            device_id,
            status,
            minutes_since_last_sample,
        }
    }
}
