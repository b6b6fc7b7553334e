mod memory;
mod postgres;

pub use memory::MemorySensorStore;
pub use postgres::{build_pool, PgSensorStore};

use crate::error::StoreError;
use crate::status::SensorStatus;
use crate::telemetry::SensorReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ReadingId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Expected seconds between readings.
    pub frequency: i64,
    pub status: SensorStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSensor {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub frequency: i64,
}

/// Partial sensor update. `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorUpdate {
    pub status: Option<SensorStatus>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SensorUpdate {
    pub fn status(status: SensorStatus) -> Self {
        Self {
            status: Some(status),
            last_seen: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.last_seen.is_none()
    }
}

/// Durable store for sensors and their time-series readings.
///
/// Implementations decide what happens to readings when a sensor is deleted; both
/// shipped backends delete them with the sensor.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Idempotent per `(sensor_id, timestamp)`: a repeat returns the id of the stored
    /// row and leaves its values untouched, so a retried write cannot duplicate it.
    async fn create_sensor_reading(&self, reading: &SensorReading)
        -> Result<ReadingId, StoreError>;

    /// Returns `Ok(None)` when the sensor does not exist.
    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, StoreError>;

    /// Fails with [`StoreError::NotFound`] when the sensor does not exist.
    async fn update_sensor(&self, id: &str, update: &SensorUpdate) -> Result<(), StoreError>;

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    /// Readings with `from <= timestamp <= to`, ascending by timestamp.
    async fn query_readings(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, StoreError>;

    /// Registers a sensor with status `RED` and no `last_seen`.
    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor, StoreError>;

    /// Deletes sensors and their readings, returning how many sensors were removed.
    async fn delete_sensors(&self, ids: &[String]) -> Result<u64, StoreError>;
}
