use crate::error::IngestError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;

const TOPIC_ROOT: &str = "sensors";
const TOPIC_LEAF: &str = "data";

/// Raw values below this are epoch seconds, everything else is epoch milliseconds.
const SECONDS_CUTOFF: f64 = 10_000_000_000.0;

const DEVICE_TIMESTAMP_KEY: &str = "ts";

/// Device key -> canonical field, in canonical order.
const DEVICE_FIELDS: [(&str, &str); 10] = [
    ("PM1", "pm1_0"),
    ("PM25", "pm2_5"),
    ("PM10", "pm10"),
    ("O3", "o3_raw"),
    ("O3c", "o3_corrige"),
    ("NO2v", "no2_voltage_v"),
    ("NO2", "no2_ppb"),
    ("VOCv", "voc_voltage_v"),
    ("COv", "co_voltage_v"),
    ("CO", "co_ppb"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub pm1_0: f64,
    pub pm2_5: f64,
    pub pm10: f64,
    pub o3_raw: f64,
    pub o3_corrige: f64,
    pub no2_voltage_v: f64,
    pub no2_ppb: f64,
    pub voc_voltage_v: f64,
    pub co_voltage_v: f64,
    pub co_ppb: f64,
}

impl SensorReading {
    pub fn measurements(&self) -> [f64; 10] {
        [
            self.pm1_0,
            self.pm2_5,
            self.pm10,
            self.o3_raw,
            self.o3_corrige,
            self.no2_voltage_v,
            self.no2_ppb,
            self.voc_voltage_v,
            self.co_voltage_v,
            self.co_ppb,
        ]
    }

    /// True when the record can be persisted as-is.
    pub fn is_complete(&self) -> bool {
        !self.sensor_id.trim().is_empty() && self.measurements().iter().all(|v| v.is_finite())
    }

    /// Builds a reading from a record that is already in canonical shape.
    pub fn from_canonical(record: serde_json::Value) -> Result<Self, IngestError> {
        if !is_valid_reading(&record) {
            return Err(IngestError::MalformedPayload(
                "record is not a canonical sensor reading".into(),
            ));
        }
        let reading: SensorReading = serde_json::from_value(record)
            .map_err(|err| IngestError::MalformedPayload(err.to_string()))?;
        if !reading.is_complete() {
            return Err(IngestError::MalformedPayload(
                "canonical reading has empty sensorId or non-finite values".into(),
            ));
        }
        Ok(reading)
    }
}

/// Extracts the sensor id from `sensors/{sensorId}/data`.
pub fn parse_sensor_topic(topic: &str) -> Result<&str, IngestError> {
    let mut parts = topic.split('/');
    let (Some(root), Some(sensor_id), Some(leaf), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(IngestError::MalformedTopic(topic.to_string()));
    };
    if root != TOPIC_ROOT
        || leaf != TOPIC_LEAF
        || sensor_id.trim().is_empty()
        || sensor_id.contains(['+', '#'])
    {
        return Err(IngestError::MalformedTopic(topic.to_string()));
    }
    Ok(sensor_id)
}

/// Parses raw MQTT bytes into a generic JSON value. The buffer is used as scratch space.
pub fn parse_payload(payload: &mut [u8]) -> Result<BorrowedValue<'_>, IngestError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::MalformedPayload("empty payload".into()));
    }
    simd_json::to_borrowed_value(payload).map_err(|err| IngestError::MalformedPayload(err.to_string()))
}

/// Maps a device payload onto the canonical reading.
///
/// All eleven device keys must be present, `ts` included: a payload without a `ts` key
/// is rejected with [`IngestError::MissingField`] rather than stamped with the arrival
/// time. Measurements must coerce to finite numbers; anything else rejects the whole
/// payload. Only a `ts` that is present falls back to `received_at`, when its value is
/// null, non-numeric or out of range.
pub fn normalize(
    raw: &BorrowedValue<'_>,
    sensor_id: &str,
    received_at: DateTime<Utc>,
) -> Result<SensorReading, IngestError> {
    let BorrowedValue::Object(obj) = raw else {
        return Err(IngestError::MalformedPayload("expected a JSON object".into()));
    };
    if sensor_id.trim().is_empty() {
        return Err(IngestError::MalformedTopic(sensor_id.to_string()));
    }

    let raw_ts = obj
        .get(DEVICE_TIMESTAMP_KEY)
        .ok_or(IngestError::MissingField(DEVICE_TIMESTAMP_KEY))?;
    for (device_key, _) in DEVICE_FIELDS {
        if !obj.contains_key(device_key) {
            return Err(IngestError::MissingField(device_key));
        }
    }

    let mut values = [0.0f64; 10];
    for (slot, (device_key, _)) in values.iter_mut().zip(DEVICE_FIELDS) {
        let value = obj
            .get(device_key)
            .ok_or(IngestError::MissingField(device_key))?;
        *slot = coerce_number(value).ok_or(IngestError::NonNumericField(device_key))?;
    }

    let timestamp = coerce_number(raw_ts)
        .and_then(epoch_to_datetime)
        .unwrap_or(received_at);

    let [pm1_0, pm2_5, pm10, o3_raw, o3_corrige, no2_voltage_v, no2_ppb, voc_voltage_v, co_voltage_v, co_ppb] =
        values;
    Ok(SensorReading {
        sensor_id: sensor_id.to_string(),
        timestamp,
        pm1_0,
        pm2_5,
        pm10,
        o3_raw,
        o3_corrige,
        no2_voltage_v,
        no2_ppb,
        voc_voltage_v,
        co_voltage_v,
        co_ppb,
    })
}

/// Applies the seconds/milliseconds rule to a device epoch value.
pub fn epoch_to_datetime(raw: f64) -> Option<DateTime<Utc>> {
    let millis = if raw < SECONDS_CUTOFF { raw * 1000.0 } else { raw };
    if !millis.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn coerce_number(value: &BorrowedValue<'_>) -> Option<f64> {
    let number = value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .or_else(|| {
            value
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse::<f64>().ok())
        })?;
    number.is_finite().then_some(number)
}

/// Checks that a canonical-shape record carries every canonical key with a usable value.
pub fn is_valid_reading(record: &serde_json::Value) -> bool {
    let Some(obj) = record.as_object() else {
        return false;
    };
    let sensor_ok = obj
        .get("sensorId")
        .and_then(|v| v.as_str())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);
    let timestamp_ok = obj
        .get("timestamp")
        .and_then(|v| v.as_str())
        .map(|v| DateTime::parse_from_rfc3339(v.trim()).is_ok())
        .unwrap_or(false);
    sensor_ok
        && timestamp_ok
        && DEVICE_FIELDS
            .iter()
            .all(|(_, canonical)| obj.get(*canonical).and_then(|v| v.as_f64()).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"ts":113,"PM1":12,"PM25":17,"PM10":20,"O3":83,"O3c":53,"NO2v":0.01,"NO2":0,"VOCv":0.08,"COv":0.40,"CO":0}"#;

    fn normalize_str(payload: &str, received_at: DateTime<Utc>) -> Result<SensorReading, IngestError> {
        let mut bytes = payload.as_bytes().to_vec();
        let value = parse_payload(&mut bytes)?;
        normalize(&value, "abc123", received_at)
    }

    #[test]
    fn normalize_maps_device_keys_to_canonical_fields() {
        let reading = normalize_str(SAMPLE, Utc::now()).expect("valid payload");
        assert_eq!(reading.sensor_id, "abc123");
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
        assert_eq!(reading.timestamp.timestamp_millis(), 113_000);
        assert!(reading.is_complete());
    }

    #[test]
    fn normalize_rejects_each_missing_key() {
        let keys = ["ts", "PM1", "PM25", "PM10", "O3", "O3c", "NO2v", "NO2", "VOCv", "COv", "CO"];
        for key in keys {
            let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
            value.as_object_mut().unwrap().remove(key);
            let payload = serde_json::to_string(&value).unwrap();
            match normalize_str(&payload, Utc::now()) {
                Err(IngestError::MissingField(missing)) => assert_eq!(missing, key),
                other => panic!("expected missing {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn millisecond_timestamps_pass_through() {
        let payload = SAMPLE.replace("\"ts\":113", "\"ts\":1700000000000");
        let reading = normalize_str(&payload, Utc::now()).unwrap();
        assert_eq!(reading.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn seconds_boundary_is_exclusive() {
        assert_eq!(
            epoch_to_datetime(9_999_999_999.0).unwrap().timestamp_millis(),
            9_999_999_999_000
        );
        assert_eq!(
            epoch_to_datetime(10_000_000_000.0).unwrap().timestamp_millis(),
            10_000_000_000
        );
        assert_eq!(epoch_to_datetime(1.5).unwrap().timestamp_millis(), 1_500);
    }

    #[test]
    fn unusable_timestamp_falls_back_to_ingestion_time() {
        let received_at = Utc.timestamp_millis_opt(1_650_000_000_123).unwrap();
        for replacement in ["\"ts\":null", "\"ts\":\"soon\"", "\"ts\":1e300"] {
            let payload = SAMPLE.replace("\"ts\":113", replacement);
            let reading = normalize_str(&payload, received_at).unwrap();
            assert_eq!(reading.timestamp, received_at, "{replacement}");
        }
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let payload = SAMPLE
            .replace("\"PM25\":17", "\"PM25\":\" 17.5 \"")
            .replace("\"ts\":113", "\"ts\":\"113\"");
        let reading = normalize_str(&payload, Utc::now()).unwrap();
        assert_eq!(reading.pm2_5, 17.5);
        assert_eq!(reading.timestamp.timestamp_millis(), 113_000);
    }

    #[test]
    fn non_numeric_measurements_reject_the_payload() {
        for replacement in ["\"CO\":\"n/a\"", "\"CO\":null", "\"CO\":true", "\"CO\":\"NaN\"", "\"CO\":[]"] {
            let payload = SAMPLE.replace("\"CO\":0", replacement);
            match normalize_str(&payload, Utc::now()) {
                Err(IngestError::NonNumericField("CO")) => {}
                other => panic!("{replacement}: expected rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn non_object_payloads_are_malformed() {
        assert!(matches!(
            normalize_str("[1,2,3]", Utc::now()),
            Err(IngestError::MalformedPayload(_))
        ));
        assert!(matches!(
            normalize_str("{not json", Utc::now()),
            Err(IngestError::MalformedPayload(_))
        ));
        assert!(matches!(
            normalize_str("   ", Utc::now()),
            Err(IngestError::MalformedPayload(_))
        ));
    }

    #[test]
    fn topic_parsing() {
        assert_eq!(parse_sensor_topic("sensors/abc123/data").unwrap(), "abc123");
        for bad in [
            "sensors/abc123",
            "sensors//data",
            "sensors/abc/data/extra",
            "devices/abc/data",
            "sensors/abc/status",
            "sensors/+/data",
            "",
        ] {
            assert!(
                matches!(parse_sensor_topic(bad), Err(IngestError::MalformedTopic(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn canonical_shape_validation() {
        let reading = normalize_str(SAMPLE, Utc::now()).unwrap();
        let record = serde_json::to_value(&reading).unwrap();
        assert!(is_valid_reading(&record));
        assert_eq!(record["sensorId"], "abc123");
        assert_eq!(SensorReading::from_canonical(record.clone()).unwrap(), reading);

        let mut missing = record.clone();
        missing.as_object_mut().unwrap().remove("voc_voltage_v");
        assert!(!is_valid_reading(&missing));

        let mut bad_ts = record.clone();
        bad_ts["timestamp"] = serde_json::json!("yesterday");
        assert!(!is_valid_reading(&bad_ts));

        let mut empty_id = record;
        empty_id["sensorId"] = serde_json::json!("  ");
        assert!(!is_valid_reading(&empty_id));
        assert!(!is_valid_reading(&serde_json::json!(42)));
    }
}
