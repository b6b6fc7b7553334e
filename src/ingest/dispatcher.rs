use super::{IngestDispatcher, RetryPolicy};
use crate::error::IngestError;
use crate::pipeline::{InboundMessage, IngestStats};
use crate::status::{compute_status, StatusThresholds};
use crate::store::{ReadingId, SensorStore, SensorUpdate};
use crate::telemetry::{normalize, parse_payload, parse_sensor_topic, SensorReading};
use chrono::{DateTime, Utc};
use std::sync::Arc;

impl IngestDispatcher {
    pub fn new(
        store: Arc<dyn SensorStore>,
        stats: Arc<IngestStats>,
        thresholds: StatusThresholds,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            stats,
            thresholds,
            retry,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn store(&self) -> Arc<dyn SensorStore> {
        self.store.clone()
    }

    /// Entry point for messages that arrive outside the broker connection; the
    /// message is counted as received here.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<ReadingId> {
        let received_at = Utc::now();
        self.stats.record_received(received_at);
        self.contain(self.process(topic, payload, received_at).await)
    }

    /// Handles a message forwarded by the connection manager, which already counted it.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Option<ReadingId> {
        self.contain(
            self.process(&message.topic, &message.payload, message.received_at)
                .await,
        )
    }

    /// Normalizes, persists and updates freshness for a single device message.
    pub async fn process(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<ReadingId, IngestError> {
        let sensor_id = parse_sensor_topic(topic)?;
        let mut scratch = payload.to_vec();
        let raw = parse_payload(&mut scratch)?;
        let reading = normalize(&raw, sensor_id, received_at)?;
        self.persist_reading(reading).await
    }

    /// Accepts a reading that is already in canonical shape.
    pub async fn ingest_canonical(
        &self,
        record: serde_json::Value,
    ) -> Result<ReadingId, IngestError> {
        self.stats.record_received(Utc::now());
        let result = match SensorReading::from_canonical(record) {
            Ok(reading) => self.persist_reading(reading).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.stats.record_rejected();
            tracing::warn!(error=%err, kind = err.kind(), "rejected canonical reading");
        }
        result
    }

    async fn persist_reading(&self, reading: SensorReading) -> Result<ReadingId, IngestError> {
        if !reading.is_complete() {
            return Err(IngestError::MalformedPayload(
                "reading has empty sensorId or non-finite values".into(),
            ));
        }
        let sensor_id = reading.sensor_id.as_str();
        let mut sensor = self
            .retry
            .run("get_sensor", || self.store.get_sensor(sensor_id))
            .await?
            .ok_or_else(|| IngestError::UnknownSensor(sensor_id.to_string()))?;

        let reading_id = self
            .retry
            .run("create_sensor_reading", || {
                self.store.create_sensor_reading(&reading)
            })
            .await?;

        // lastSeen follows processing order, not timestamp order. The status is always
        // written: the snapshot may predate a sweep that changed the stored row.
        sensor.last_seen = Some(reading.timestamp);
        let status = compute_status(&sensor, Utc::now(), self.thresholds);
        let update = SensorUpdate {
            status: Some(status),
            last_seen: Some(reading.timestamp),
        };
        self.retry
            .run("update_sensor", || self.store.update_sensor(sensor_id, &update))
            .await?;

        self.stats.record_persisted();
        tracing::debug!(
            sensor_id,
            reading_id,
            timestamp=%reading.timestamp,
            status=%status,
            "persisted sensor reading"
        );
        Ok(reading_id)
    }

    fn contain(&self, result: Result<ReadingId, IngestError>) -> Option<ReadingId> {
        match result {
            Ok(id) => Some(id),
            Err(err) => {
                self.stats.record_rejected();
                if let IngestError::Persistence { .. } = &err {
                    self.stats.record_error(err.to_string());
                }
                tracing::warn!(error=%err, kind = err.kind(), "rejected sensor message");
                None
            }
        }
    }
}
