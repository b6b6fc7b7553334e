use super::{NewSensor, ReadingId, Sensor, SensorStore, SensorUpdate};
use crate::error::StoreError;
use crate::status::SensorStatus;
use crate::telemetry::SensorReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    sensors: HashMap<String, Sensor>,
    readings: Vec<(ReadingId, SensorReading)>,
    next_reading_id: ReadingId,
}

/// In-process store. Used by `SENSOR_INGEST_STORE=memory` deployments and by tests.
#[derive(Debug, Default)]
pub struct MemorySensorStore {
    state: RwLock<MemoryState>,
    failing_writes: AtomicU32,
    reading_writes: AtomicU64,
    sensor_writes: AtomicU64,
}

impl MemorySensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` reading writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Rows added by `create_sensor_reading` so far.
    pub fn reading_writes(&self) -> u64 {
        self.reading_writes.load(Ordering::SeqCst)
    }

    /// Successful `update_sensor` calls so far.
    pub fn sensor_writes(&self) -> u64 {
        self.sensor_writes.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SensorStore for MemorySensorStore {
    async fn create_sensor_reading(
        &self,
        reading: &SensorReading,
    ) -> Result<ReadingId, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Transient("injected write failure".into()));
        }
        let mut state = self.state.write().await;
        if !state.sensors.contains_key(&reading.sensor_id) {
            return Err(StoreError::NotFound);
        }
        if let Some((id, _)) = state.readings.iter().find(|(_, stored)| {
            stored.sensor_id == reading.sensor_id && stored.timestamp == reading.timestamp
        }) {
            return Ok(*id);
        }
        state.next_reading_id += 1;
        let id = state.next_reading_id;
        state.readings.push((id, reading.clone()));
        self.reading_writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, StoreError> {
        let state = self.state.read().await;
        Ok(state.sensors.get(id).cloned())
    }

    async fn update_sensor(&self, id: &str, update: &SensorUpdate) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let sensor = state.sensors.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(status) = update.status {
            sensor.status = status;
        }
        if let Some(last_seen) = update.last_seen {
            sensor.last_seen = Some(last_seen);
        }
        self.sensor_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let state = self.state.read().await;
        let mut sensors: Vec<Sensor> = state.sensors.values().cloned().collect();
        sensors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sensors)
    }

    async fn query_readings(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<(ReadingId, SensorReading)> = state
            .readings
            .iter()
            .filter(|(_, reading)| {
                reading.sensor_id == sensor_id && reading.timestamp >= from && reading.timestamp <= to
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)));
        Ok(rows.into_iter().map(|(_, reading)| reading).collect())
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor, StoreError> {
        let mut state = self.state.write().await;
        if state.sensors.contains_key(&sensor.id) {
            return Err(StoreError::Conflict(format!(
                "sensor `{}` already exists",
                sensor.id
            )));
        }
        let created = Sensor {
            id: sensor.id.clone(),
            name: sensor.name.clone(),
            latitude: sensor.latitude,
            longitude: sensor.longitude,
            frequency: sensor.frequency,
            status: SensorStatus::Red,
            last_seen: None,
            created_at: Utc::now(),
        };
        state.sensors.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn delete_sensors(&self, ids: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let MemoryState {
            sensors, readings, ..
        } = &mut *state;
        let mut removed = 0u64;
        for id in ids {
            if sensors.remove(id).is_some() {
                removed += 1;
            }
        }
        readings.retain(|(_, reading)| sensors.contains_key(&reading.sensor_id));
        Ok(removed)
    }
}
