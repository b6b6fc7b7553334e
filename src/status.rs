use crate::error::StoreError;
use crate::store::{Sensor, SensorStore, SensorUpdate};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_GREEN_MULTIPLIER: u32 = 2;
pub const DEFAULT_YELLOW_MULTIPLIER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorStatus {
    Red,
    Yellow,
    Green,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Red => "RED",
            SensorStatus::Yellow => "YELLOW",
            SensorStatus::Green => "GREEN",
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RED" => Ok(SensorStatus::Red),
            "YELLOW" => Ok(SensorStatus::Yellow),
            "GREEN" => Ok(SensorStatus::Green),
            other => Err(format!("unknown sensor status `{other}`")),
        }
    }
}

/// Freshness multipliers applied to a sensor's expected frequency.
///
/// A sensor is `GREEN` while `elapsed <= green * frequency`, `YELLOW` while
/// `elapsed <= yellow * frequency`, and `RED` after that or when it never reported.
/// Both values come from configuration (`SENSOR_INGEST_STATUS_GREEN_MULTIPLIER`,
/// `SENSOR_INGEST_STATUS_YELLOW_MULTIPLIER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    green: u32,
    yellow: u32,
}

impl StatusThresholds {
    pub fn new(green: u32, yellow: u32) -> Option<Self> {
        (green > 0 && green < yellow).then_some(Self { green, yellow })
    }

    pub fn green(&self) -> u32 {
        self.green
    }

    pub fn yellow(&self) -> u32 {
        self.yellow
    }
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            green: DEFAULT_GREEN_MULTIPLIER,
            yellow: DEFAULT_YELLOW_MULTIPLIER,
        }
    }
}

/// Classifies a sensor from its last reading time. Pure in all inputs.
pub fn compute_status(
    sensor: &Sensor,
    now: DateTime<Utc>,
    thresholds: StatusThresholds,
) -> SensorStatus {
    let Some(last_seen) = sensor.last_seen else {
        return SensorStatus::Red;
    };
    let elapsed_ms = (now - last_seen).num_milliseconds().max(0);
    let expected_ms = sensor.frequency.max(1).saturating_mul(1000);

    if elapsed_ms <= expected_ms.saturating_mul(thresholds.green as i64) {
        SensorStatus::Green
    } else if elapsed_ms <= expected_ms.saturating_mul(thresholds.yellow as i64) {
        SensorStatus::Yellow
    } else {
        SensorStatus::Red
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSweep {
    pub evaluated: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct StatusCalculator {
    store: Arc<dyn SensorStore>,
    thresholds: StatusThresholds,
}

impl StatusCalculator {
    pub fn new(store: Arc<dyn SensorStore>, thresholds: StatusThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> StatusThresholds {
        self.thresholds
    }

    pub fn compute_status(&self, sensor: &Sensor) -> SensorStatus {
        compute_status(sensor, Utc::now(), self.thresholds)
    }

    /// Recomputes every sensor and writes only the ones whose status changed.
    ///
    /// Only the status column is written, so a concurrent `last_seen` update from the
    /// dispatcher is never overwritten.
    pub async fn update_all_sensor_statuses(&self) -> Result<StatusSweep, StoreError> {
        self.update_all_at(Utc::now()).await
    }

    pub async fn update_all_at(&self, now: DateTime<Utc>) -> Result<StatusSweep, StoreError> {
        let sensors = self.store.list_sensors().await?;
        let mut sweep = StatusSweep {
            evaluated: sensors.len(),
            ..StatusSweep::default()
        };

        for sensor in sensors {
            let computed = compute_status(&sensor, now, self.thresholds);
            if computed == sensor.status {
                continue;
            }
            match self
                .store
                .update_sensor(&sensor.id, &SensorUpdate::status(computed))
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        sensor = %sensor.id,
                        from = %sensor.status,
                        to = %computed,
                        "sensor status changed"
                    );
                    sweep.changed += 1;
                }
                // Deleted between the listing and the write.
                Err(StoreError::NotFound) => {}
                Err(err) => {
                    tracing::warn!(sensor = %sensor.id, error = %err, "failed to persist sensor status");
                    sweep.failed += 1;
                }
            }
        }

        Ok(sweep)
    }

    /// Listing with freshness-on-read: statuses are recomputed before the sensors are read.
    pub async fn list_sensors_fresh(&self) -> Result<Vec<Sensor>, StoreError> {
        if let Err(err) = self.update_all_sensor_statuses().await {
            tracing::warn!(error = %err, "status refresh before listing failed");
        }
        self.store.list_sensors().await
    }

    /// Periodic recompute until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.update_all_sensor_statuses().await {
                        Ok(sweep) => tracing::debug!(
                            evaluated = sweep.evaluated,
                            changed = sweep.changed,
                            failed = sweep.failed,
                            "status sweep complete"
                        ),
                        Err(err) => tracing::warn!(error = %err, "status sweep failed"),
                    }
                }
            }
        }
        Ok(())
    }
}
