use crate::mqtt::{BackoffKind, ReconnectPolicy};
use crate::status::{StatusThresholds, DEFAULT_GREEN_MULTIPLIER, DEFAULT_YELLOW_MULTIPLIER};
use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/sensor-ingest/config.json";
pub const DEFAULT_TOPIC_FILTER: &str = "sensors/+/data";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("SENSOR_INGEST_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_tls: Option<bool>,
    #[serde(default)]
    mqtt_topic: Option<String>,
    #[serde(default)]
    status_green_multiplier: Option<u32>,
    #[serde(default)]
    status_yellow_multiplier: Option<u32>,
    #[serde(default)]
    status_poll_interval_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "sensor-ingest failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "sensor-ingest failed to parse setup config; using env defaults"
        );
        None
    })
}

fn parse_setup_config(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

/// Environment wins over the setup file; the file only fills keys the environment left unset.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    let env_allows = |key: &str| env_value(key).is_none();

    if config.database_url.is_none() {
        config.database_url = overrides
            .database_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(normalize_database_url);
    }
    if env_allows("SENSOR_INGEST_MQTT_HOST") {
        if let Some(host) = overrides
            .mqtt_host
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.mqtt_host = host.to_string();
        }
    }
    if env_allows("SENSOR_INGEST_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("SENSOR_INGEST_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(username);
        }
    }
    if env_allows("SENSOR_INGEST_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(password);
        }
    }
    if env_allows("SENSOR_INGEST_MQTT_TLS") {
        if let Some(tls) = overrides.mqtt_tls {
            config.mqtt_tls = tls;
        }
    }
    if env_allows("SENSOR_INGEST_MQTT_TOPIC") {
        if let Some(topic) = overrides.mqtt_topic.as_deref().and_then(non_empty) {
            config.mqtt_topic = topic;
        }
    }
    if env_allows("SENSOR_INGEST_STATUS_GREEN_MULTIPLIER") {
        if let Some(value) = overrides.status_green_multiplier.filter(|v| *v != 0) {
            config.status_green_multiplier = value;
        }
    }
    if env_allows("SENSOR_INGEST_STATUS_YELLOW_MULTIPLIER") {
        if let Some(value) = overrides.status_yellow_multiplier.filter(|v| *v != 0) {
            config.status_yellow_multiplier = value;
        }
    }
    if env_allows("SENSOR_INGEST_STATUS_POLL_INTERVAL_MS") {
        if let Some(value) = overrides.status_poll_interval_ms.filter(|v| *v != 0) {
            config.status_poll_interval_ms = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub store_retry_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_ca_path: Option<PathBuf>,
    pub mqtt_cert_path: Option<PathBuf>,
    pub mqtt_key_path: Option<PathBuf>,
    pub mqtt_topic: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub max_queue: usize,
    pub reconnect_backoff: BackoffKind,
    pub reconnect_delay_ms: u64,
    pub reconnect_fast_attempts: u32,
    pub reconnect_max_delay_ms: u64,
    pub persist_retries: u32,
    pub persist_retry_base_ms: u64,
    pub status_green_multiplier: u32,
    pub status_yellow_multiplier: u32,
    pub status_poll_interval_ms: u64,
    pub http_bind: String,
    pub shutdown_grace_ms: u64,
    pub otlp_endpoint: Option<String>,
    /// Values that were rejected and replaced by their defaults.
    pub config_errors: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Postgres,
            database_url: None,
            db_pool_size: 10,
            store_retry_ms: 10_000,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_tls: false,
            mqtt_ca_path: None,
            mqtt_cert_path: None,
            mqtt_key_path: None,
            mqtt_topic: DEFAULT_TOPIC_FILTER.to_string(),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: format!("sensor-ingest-{}", std::process::id()),
            max_queue: 1024,
            reconnect_backoff: BackoffKind::Fixed,
            reconnect_delay_ms: 1000,
            reconnect_fast_attempts: 5,
            reconnect_max_delay_ms: 30_000,
            persist_retries: 3,
            persist_retry_base_ms: 200,
            status_green_multiplier: DEFAULT_GREEN_MULTIPLIER,
            status_yellow_multiplier: DEFAULT_YELLOW_MULTIPLIER,
            status_poll_interval_ms: 30_000,
            http_bind: "0.0.0.0:8088".to_string(),
            shutdown_grace_ms: 5000,
            otlp_endpoint: None,
            config_errors: Vec::new(),
        }
    }
}

impl Config {
    /// Never fails on a missing database URL or an unrecognised enum value: those
    /// surface later as an unhealthy health report so the process stays observable.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Config::default();
        let mut config_errors = Vec::new();
        let store_backend =
            choice_env("SENSOR_INGEST_STORE", defaults.store_backend, &mut config_errors);
        let database_url = env_value("SENSOR_INGEST_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .map(|url| normalize_database_url(&url));
        let reconnect_backoff = choice_env(
            "SENSOR_INGEST_RECONNECT_BACKOFF",
            defaults.reconnect_backoff,
            &mut config_errors,
        );

        let mut config = Self {
            store_backend,
            database_url,
            db_pool_size: parsed_env("SENSOR_INGEST_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            store_retry_ms: parsed_env("SENSOR_INGEST_STORE_RETRY_MS")
                .unwrap_or(defaults.store_retry_ms),
            mqtt_host: env_value("SENSOR_INGEST_MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: parsed_env("SENSOR_INGEST_MQTT_PORT").unwrap_or(defaults.mqtt_port),
            mqtt_username: env_value("SENSOR_INGEST_MQTT_USERNAME"),
            mqtt_password: env_value("SENSOR_INGEST_MQTT_PASSWORD"),
            mqtt_tls: env_value("SENSOR_INGEST_MQTT_TLS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.mqtt_tls),
            mqtt_ca_path: env_value("SENSOR_INGEST_MQTT_CA_PATH").map(PathBuf::from),
            mqtt_cert_path: env_value("SENSOR_INGEST_MQTT_CERT_PATH").map(PathBuf::from),
            mqtt_key_path: env_value("SENSOR_INGEST_MQTT_KEY_PATH").map(PathBuf::from),
            mqtt_topic: env_value("SENSOR_INGEST_MQTT_TOPIC").unwrap_or(defaults.mqtt_topic),
            mqtt_keepalive_secs: parsed_env("SENSOR_INGEST_MQTT_KEEPALIVE_SECS")
                .unwrap_or(defaults.mqtt_keepalive_secs),
            mqtt_client_id: env_value("SENSOR_INGEST_MQTT_CLIENT_ID")
                .unwrap_or(defaults.mqtt_client_id),
            max_queue: parsed_env("SENSOR_INGEST_MAX_QUEUE").unwrap_or(defaults.max_queue),
            reconnect_backoff,
            reconnect_delay_ms: parsed_env("SENSOR_INGEST_RECONNECT_DELAY_MS")
                .unwrap_or(defaults.reconnect_delay_ms),
            reconnect_fast_attempts: parsed_env("SENSOR_INGEST_RECONNECT_FAST_ATTEMPTS")
                .unwrap_or(defaults.reconnect_fast_attempts),
            reconnect_max_delay_ms: parsed_env("SENSOR_INGEST_RECONNECT_MAX_DELAY_MS")
                .unwrap_or(defaults.reconnect_max_delay_ms),
            persist_retries: parsed_env("SENSOR_INGEST_PERSIST_RETRIES")
                .unwrap_or(defaults.persist_retries),
            persist_retry_base_ms: parsed_env("SENSOR_INGEST_PERSIST_RETRY_BASE_MS")
                .unwrap_or(defaults.persist_retry_base_ms),
            status_green_multiplier: parsed_env("SENSOR_INGEST_STATUS_GREEN_MULTIPLIER")
                .unwrap_or(defaults.status_green_multiplier),
            status_yellow_multiplier: parsed_env("SENSOR_INGEST_STATUS_YELLOW_MULTIPLIER")
                .unwrap_or(defaults.status_yellow_multiplier),
            status_poll_interval_ms: parsed_env("SENSOR_INGEST_STATUS_POLL_INTERVAL_MS")
                .unwrap_or(defaults.status_poll_interval_ms),
            http_bind: env_value("SENSOR_INGEST_HTTP_BIND").unwrap_or(defaults.http_bind),
            shutdown_grace_ms: parsed_env("SENSOR_INGEST_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace_ms),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
            config_errors,
        };

        if let Some(overrides) = load_setup_config_overrides() {
            apply_setup_overrides(&mut config, &overrides);
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs.max(5))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(100))
    }

    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_ms.max(100))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn persist_retry_base(&self) -> Duration {
        Duration::from_millis(self.persist_retry_base_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            kind: self.reconnect_backoff,
            base_delay: Duration::from_millis(self.reconnect_delay_ms.max(1)),
            fast_attempts: self.reconnect_fast_attempts,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_delay_ms)),
        }
    }

    pub fn status_thresholds(&self) -> StatusThresholds {
        StatusThresholds::new(self.status_green_multiplier, self.status_yellow_multiplier)
            .unwrap_or_else(|| {
                tracing::warn!(
                    green = self.status_green_multiplier,
                    yellow = self.status_yellow_multiplier,
                    "status multipliers must satisfy 0 < green < yellow; using defaults"
                );
                StatusThresholds::default()
            })
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_env<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|v| v.parse::<T>().ok())
}

/// Parses an enumerated setting; an unknown value keeps `default` and is recorded.
fn choice_env<T>(key: &str, default: T, errors: &mut Vec<String>) -> T
where
    T: FromStr<Err = String> + std::fmt::Debug,
{
    let Some(raw) = env_value(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key, value=%raw, fallback=?default, "invalid setting; using default");
            errors.push(format!("{key}: {err}"));
            default
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn normalize_database_url(url: &str) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url.to_string()
}
