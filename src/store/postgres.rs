use super::{NewSensor, ReadingId, Sensor, SensorStore, SensorUpdate};
use crate::error::StoreError;
use crate::status::SensorStatus;
use crate::telemetry::SensorReading;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgSensorStore {
    pool: PgPool,
}

impl PgSensorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id text primary key,
                name text not null default '',
                latitude double precision not null default 0,
                longitude double precision not null default 0,
                frequency integer not null default 60,
                status text not null default 'RED',
                last_seen timestamptz null,
                created_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id bigserial primary key,
                sensor_id text not null references sensors(id) on delete cascade,
                ts timestamptz not null,
                pm1_0 double precision not null,
                pm2_5 double precision not null,
                pm10 double precision not null,
                o3_raw double precision not null,
                o3_corrige double precision not null,
                no2_voltage_v double precision not null,
                no2_ppb double precision not null,
                voc_voltage_v double precision not null,
                co_voltage_v double precision not null,
                co_ppb double precision not null,
                inserted_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS sensor_readings_sensor_ts_key ON sensor_readings (sensor_id, ts)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sensor_from_row(row: &PgRow) -> Result<Sensor, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Sensor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        frequency: row.try_get::<i32, _>("frequency")? as i64,
        status: status.parse().unwrap_or_else(|_| {
            tracing::warn!(status = %status, "unrecognised sensor status in store; treating as RED");
            SensorStatus::Red
        }),
        last_seen: row.try_get("last_seen")?,
        created_at: row.try_get("created_at")?,
    })
}

fn reading_from_row(row: &PgRow) -> Result<SensorReading, StoreError> {
    Ok(SensorReading {
        sensor_id: row.try_get("sensor_id")?,
        timestamp: row.try_get("ts")?,
        pm1_0: row.try_get("pm1_0")?,
        pm2_5: row.try_get("pm2_5")?,
        pm10: row.try_get("pm10")?,
        o3_raw: row.try_get("o3_raw")?,
        o3_corrige: row.try_get("o3_corrige")?,
        no2_voltage_v: row.try_get("no2_voltage_v")?,
        no2_ppb: row.try_get("no2_ppb")?,
        voc_voltage_v: row.try_get("voc_voltage_v")?,
        co_voltage_v: row.try_get("co_voltage_v")?,
        co_ppb: row.try_get("co_ppb")?,
    })
}

const SENSOR_COLUMNS: &str =
    "id, name, latitude, longitude, frequency, status, last_seen, created_at";

#[async_trait]
impl SensorStore for PgSensorStore {
    async fn create_sensor_reading(
        &self,
        reading: &SensorReading,
    ) -> Result<ReadingId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sensor_readings (
                sensor_id, ts, pm1_0, pm2_5, pm10, o3_raw, o3_corrige,
                no2_voltage_v, no2_ppb, voc_voltage_v, co_voltage_v, co_ppb
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (sensor_id, ts) DO UPDATE SET sensor_id = EXCLUDED.sensor_id
            RETURNING id
            "#,
        )
        .bind(&reading.sensor_id)
        .bind(reading.timestamp)
        .bind(reading.pm1_0)
        .bind(reading.pm2_5)
        .bind(reading.pm10)
        .bind(reading.o3_raw)
        .bind(reading.o3_corrige)
        .bind(reading.no2_voltage_v)
        .bind(reading.no2_ppb)
        .bind(reading.voc_voltage_v)
        .bind(reading.co_voltage_v)
        .bind(reading.co_ppb)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sensor_from_row).transpose()
    }

    async fn update_sensor(&self, id: &str, update: &SensorUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sensors
            SET status = COALESCE($2, status),
                last_seen = COALESCE($3, last_seen)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|status| status.as_str()))
        .bind(update.last_seen)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sensor_from_row).collect()
    }

    async fn query_readings(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                sensor_id, ts, pm1_0, pm2_5, pm10, o3_raw, o3_corrige,
                no2_voltage_v, no2_ppb, voc_voltage_v, co_voltage_v, co_ppb
            FROM sensor_readings
            WHERE sensor_id = $1
              AND ts >= $2
              AND ts <= $3
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(sensor_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reading_from_row).collect()
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sensors (id, name, latitude, longitude, frequency, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SENSOR_COLUMNS}
            "#
        ))
        .bind(&sensor.id)
        .bind(&sensor.name)
        .bind(sensor.latitude)
        .bind(sensor.longitude)
        .bind(i32::try_from(sensor.frequency).unwrap_or(i32::MAX))
        .bind(SensorStatus::Red.as_str())
        .fetch_one(&self.pool)
        .await?;
        sensor_from_row(&row)
    }

    async fn delete_sensors(&self, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM sensors WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::env;

    async fn setup_test_store(database_url: &str, schema: &str) -> Result<(PgSensorStore, PgPool)> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        let store = PgSensorStore::new(pool);
        store.ensure_schema().await?;
        Ok((store, admin_pool))
    }

    fn sample_reading(sensor_id: &str, timestamp: DateTime<Utc>, pm2_5: f64) -> SensorReading {
        SensorReading {
            sensor_id: sensor_id.to_string(),
            timestamp,
            pm1_0: 1.0,
            pm2_5,
            pm10: 3.0,
            o3_raw: 4.0,
            o3_corrige: 5.0,
            no2_voltage_v: 0.1,
            no2_ppb: 6.0,
            voc_voltage_v: 0.2,
            co_voltage_v: 0.3,
            co_ppb: 7.0,
        }
    }

    #[tokio::test]
    async fn test_postgres_store_roundtrip_and_cascade() -> Result<()> {
        if env::var("SENSOR_INGEST_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("SENSOR_INGEST_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };
        let schema = format!("sensor_ingest_test_{}", std::process::id());
        let (store, admin_pool) = setup_test_store(&database_url, &schema).await?;

        let created = store
            .create_sensor(&NewSensor {
                id: "abc123".into(),
                name: "Roof".into(),
                latitude: 45.5,
                longitude: -73.6,
                frequency: 60,
            })
            .await?;
        assert_eq!(created.status, SensorStatus::Red);
        assert!(created.last_seen.is_none());

        let base = Utc::now();
        store
            .create_sensor_reading(&sample_reading("abc123", base, 2.0))
            .await?;
        store
            .create_sensor_reading(&sample_reading(
                "abc123",
                base - ChronoDuration::seconds(30),
                1.0,
            ))
            .await?;

        let readings = store
            .query_readings(
                "abc123",
                base - ChronoDuration::minutes(5),
                base + ChronoDuration::minutes(5),
            )
            .await?;
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].pm2_5, 1.0);

        let first = store
            .create_sensor_reading(&sample_reading("abc123", base, 2.0))
            .await?;
        let again = store
            .create_sensor_reading(&sample_reading("abc123", base, 9.0))
            .await?;
        assert_eq!(first, again, "replayed reading keeps its row");
        assert_eq!(readings[1].pm2_5, 2.0);

        store
            .update_sensor(
                "abc123",
                &SensorUpdate {
                    status: Some(SensorStatus::Green),
                    last_seen: Some(base),
                },
            )
            .await?;
        let sensor = store.get_sensor("abc123").await?.expect("sensor");
        assert_eq!(sensor.status, SensorStatus::Green);
        assert!(sensor.last_seen.is_some());

        store
            .update_sensor("abc123", &SensorUpdate::status(SensorStatus::Yellow))
            .await?;
        let sensor = store.get_sensor("abc123").await?.expect("sensor");
        assert_eq!(sensor.status, SensorStatus::Yellow);
        assert!(sensor.last_seen.is_some(), "status update keeps last_seen");

        let missing = store
            .update_sensor("nope", &SensorUpdate::status(SensorStatus::Green))
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound)));

        assert_eq!(store.delete_sensors(&["abc123".to_string()]).await?, 1);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(&store.pool)
            .await?;
        assert_eq!(count, 0);

        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
        Ok(())
    }
}
