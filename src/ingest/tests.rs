use super::{IngestDispatcher, RetryPolicy};
use crate::error::{IngestError, StoreError};
use crate::pipeline::{self, spawn_worker, InboundMessage, IngestStats};
use crate::status::{SensorStatus, StatusThresholds};
use crate::store::{MemorySensorStore, NewSensor, ReadingId, Sensor, SensorStore, SensorUpdate};
use crate::telemetry::SensorReading;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SAMPLE: &str = r#"{"ts":113,"PM1":12,"PM25":17,"PM10":20,"O3":83,"O3c":53,"NO2v":0.01,"NO2":0,"VOCv":0.08,"COv":0.40,"CO":0}"#;

async fn store_with_sensor(id: &str) -> Arc<MemorySensorStore> {
    let store = Arc::new(MemorySensorStore::new());
    store
        .create_sensor(&NewSensor {
            id: id.into(),
            name: format!("station {id}"),
            latitude: 48.85,
            longitude: 2.35,
            frequency: 60,
        })
        .await
        .unwrap();
    store
}

fn dispatcher_for(store: Arc<MemorySensorStore>, retries: u32) -> IngestDispatcher {
    IngestDispatcher::new(
        store,
        Arc::new(IngestStats::new()),
        StatusThresholds::default(),
        RetryPolicy {
            retries,
            base_delay: Duration::from_millis(1),
        },
    )
}

fn payload_at(ts: &str) -> String {
    SAMPLE.replace("\"ts\":113", &format!("\"ts\":{ts}"))
}

fn all_time() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    (
        Utc.timestamp_opt(0, 0).unwrap(),
        Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn sample_message_is_persisted_and_touches_sensor() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let id = dispatcher
        .handle_message("sensors/abc123/data", SAMPLE.as_bytes())
        .await;
    assert!(id.is_some());

    let (from, to) = all_time();
    let readings = store.query_readings("abc123", from, to).await.unwrap();
    assert_eq!(readings.len(), 1);
    let reading = &readings[0];
    assert_eq!(reading.sensor_id, "abc123");
    assert_eq!(reading.timestamp, Utc.timestamp_millis_opt(113_000).unwrap());
    assert_eq!(reading.pm1_0, 12.0);
    assert_eq!(reading.pm2_5, 17.0);
    assert_eq!(reading.pm10, 20.0);
    assert_eq!(reading.o3_raw, 83.0);
    assert_eq!(reading.o3_corrige, 53.0);
    assert_eq!(reading.no2_voltage_v, 0.01);
    assert_eq!(reading.no2_ppb, 0.0);
    assert_eq!(reading.voc_voltage_v, 0.08);
    assert_eq!(reading.co_voltage_v, 0.40);
    assert_eq!(reading.co_ppb, 0.0);

    let sensor = store.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(sensor.last_seen, Some(reading.timestamp));
    // A reading from 1970 is long stale.
    assert_eq!(sensor.status, SensorStatus::Red);

    let stats = dispatcher.stats().snapshot();
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_persisted, 1);
    assert_eq!(stats.messages_rejected, 0);
}

#[tokio::test]
async fn fresh_reading_turns_sensor_green() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let now_ms = Utc::now().timestamp_millis().to_string();
    dispatcher
        .handle_message("sensors/abc123/data", payload_at(&now_ms).as_bytes())
        .await
        .expect("persisted");

    let sensor = store.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(sensor.status, SensorStatus::Green);
}

/// Serves a fixed sensor snapshot from `get_sensor`, as if a status sweep rewrote the
/// row after the dispatcher read it.
struct StaleSnapshotStore {
    inner: Arc<MemorySensorStore>,
    snapshot: Sensor,
}

#[async_trait]
impl SensorStore for StaleSnapshotStore {
    async fn create_sensor_reading(&self, reading: &SensorReading) -> Result<ReadingId, StoreError> {
        self.inner.create_sensor_reading(reading).await
    }

    async fn get_sensor(&self, _id: &str) -> Result<Option<Sensor>, StoreError> {
        Ok(Some(self.snapshot.clone()))
    }

    async fn update_sensor(&self, id: &str, update: &SensorUpdate) -> Result<(), StoreError> {
        self.inner.update_sensor(id, update).await
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        self.inner.list_sensors().await
    }

    async fn query_readings(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, StoreError> {
        self.inner.query_readings(sensor_id, from, to).await
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor, StoreError> {
        self.inner.create_sensor(sensor).await
    }

    async fn delete_sensors(&self, ids: &[String]) -> Result<u64, StoreError> {
        self.inner.delete_sensors(ids).await
    }
}

#[tokio::test]
async fn status_is_written_even_when_snapshot_already_matches() {
    let inner = store_with_sensor("abc123").await;
    let mut snapshot = inner.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(snapshot.status, SensorStatus::Red);
    snapshot.status = SensorStatus::Green;

    let store = Arc::new(StaleSnapshotStore {
        inner: inner.clone(),
        snapshot,
    });
    let dispatcher = IngestDispatcher::new(
        store,
        Arc::new(IngestStats::new()),
        StatusThresholds::default(),
        RetryPolicy::default(),
    );

    let now_ms = Utc::now().timestamp_millis().to_string();
    dispatcher
        .handle_message("sensors/abc123/data", payload_at(&now_ms).as_bytes())
        .await
        .expect("persisted");

    let sensor = inner.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(sensor.status, SensorStatus::Green);
}

#[tokio::test]
async fn replayed_message_is_stored_once() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let first = dispatcher
        .handle_message("sensors/abc123/data", SAMPLE.as_bytes())
        .await
        .expect("persisted");
    let replay = dispatcher
        .handle_message("sensors/abc123/data", SAMPLE.as_bytes())
        .await
        .expect("replay accepted");
    assert_eq!(first, replay);

    let (from, to) = all_time();
    assert_eq!(store.query_readings("abc123", from, to).await.unwrap().len(), 1);
    assert_eq!(store.reading_writes(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let store = store_with_sensor("abc123").await;
    store.fail_next_writes(2);
    let dispatcher = dispatcher_for(store.clone(), 3);

    assert!(dispatcher
        .handle_message("sensors/abc123/data", SAMPLE.as_bytes())
        .await
        .is_some());
    assert_eq!(store.reading_writes(), 1);
    assert_eq!(dispatcher.stats().snapshot().messages_rejected, 0);
}

#[tokio::test]
async fn exhausted_retries_drop_the_message() {
    let store = store_with_sensor("abc123").await;
    store.fail_next_writes(10);
    let dispatcher = dispatcher_for(store.clone(), 2);

    let err = dispatcher
        .process("sensors/abc123/data", SAMPLE.as_bytes(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Persistence { attempts: 3, .. }));

    assert!(dispatcher
        .handle_message("sensors/abc123/data", SAMPLE.as_bytes())
        .await
        .is_none());
    let stats = dispatcher.stats().snapshot();
    assert_eq!(stats.messages_rejected, 1);
    assert!(stats.last_error.is_some());
    assert_eq!(store.reading_writes(), 0);

    let sensor = store.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(sensor.last_seen, None);
}

#[tokio::test]
async fn invalid_messages_are_counted_and_never_stored() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let cases: [(&str, &[u8]); 5] = [
        ("sensors/abc123", SAMPLE.as_bytes()),
        ("sensors/abc123/data", b"not json"),
        ("sensors/abc123/data", b""),
        ("sensors/abc123/data", br#"{"ts":113,"PM1":12}"#),
        ("sensors/abc123/data", br#"[1,2,3]"#),
    ];
    for (topic, payload) in cases {
        assert!(dispatcher.handle_message(topic, payload).await.is_none());
    }

    let stats = dispatcher.stats().snapshot();
    assert_eq!(stats.messages_received, 5);
    assert_eq!(stats.messages_rejected, 5);
    assert_eq!(store.reading_writes(), 0);
    assert_eq!(store.sensor_writes(), 0);
}

#[tokio::test]
async fn unknown_sensor_is_rejected() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let err = dispatcher
        .process("sensors/ghost/data", SAMPLE.as_bytes(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownSensor(id) if id == "ghost"));
    assert_eq!(store.reading_writes(), 0);
}

#[tokio::test]
async fn last_seen_follows_processing_order() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    for ts in ["1700000000000", "1600000000000"] {
        dispatcher
            .handle_message("sensors/abc123/data", payload_at(ts).as_bytes())
            .await
            .expect("persisted");
    }

    let sensor = store.get_sensor("abc123").await.unwrap().unwrap();
    assert_eq!(
        sensor.last_seen,
        Some(Utc.timestamp_millis_opt(1_600_000_000_000).unwrap())
    );
    let (from, to) = all_time();
    assert_eq!(store.query_readings("abc123", from, to).await.unwrap().len(), 2);
}

#[tokio::test]
async fn canonical_readings_are_validated() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);

    let record = serde_json::json!({
        "sensorId": "abc123",
        "timestamp": "2024-05-01T12:00:00Z",
        "pm1_0": 1.0, "pm2_5": 2.0, "pm10": 3.0, "o3_raw": 4.0, "o3_corrige": 5.0,
        "no2_voltage_v": 0.1, "no2_ppb": 6.0, "voc_voltage_v": 0.2,
        "co_voltage_v": 0.3, "co_ppb": 7.0
    });
    dispatcher
        .ingest_canonical(record.clone())
        .await
        .expect("canonical reading accepted");

    let mut broken = record;
    broken["pm10"] = serde_json::json!("high");
    let err = dispatcher.ingest_canonical(broken).await.unwrap_err();
    assert!(matches!(err, IngestError::MalformedPayload(_)));

    let stats = dispatcher.stats().snapshot();
    assert_eq!(stats.messages_persisted, 1);
    assert_eq!(stats.messages_rejected, 1);
}

#[tokio::test]
async fn worker_drains_queue_on_shutdown() {
    let store = store_with_sensor("abc123").await;
    let dispatcher = dispatcher_for(store.clone(), 0);
    let stats = dispatcher.stats();
    let (tx, rx) = pipeline::channel(8);

    for offset in 0..3i64 {
        stats.queue_depth.fetch_add(1, Ordering::SeqCst);
        tx.send(InboundMessage {
            topic: "sensors/abc123/data".into(),
            payload: Bytes::from(payload_at(&(1_700_000_000_000 + offset).to_string())),
            received_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), spawn_worker(dispatcher, rx, cancel))
        .await
        .expect("worker exits")
        .unwrap();

    assert_eq!(store.reading_writes(), 3);
    assert_eq!(stats.snapshot().queue_depth, 0);
    assert!(tx.send(InboundMessage {
        topic: "sensors/abc123/data".into(),
        payload: Bytes::from_static(b"{}"),
        received_at: Utc::now(),
    })
    .await
    .is_err());
}
