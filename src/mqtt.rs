use crate::config::Config;
use crate::error::IngestError;
use crate::pipeline::{InboundMessage, IngestStats};
use crate::telemetry::parse_sensor_topic;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS, TlsConfiguration,
    Transport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const CLIENT_CAPACITY: usize = 64;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" | "exp" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown reconnect backoff `{other}`")),
        }
    }
}

/// Delay before reconnect attempt `n` (1-based) after the connection was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
    pub fast_attempts: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: Duration::from_secs(1),
            fast_attempts: 5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.kind {
            BackoffKind::Fixed if attempt <= self.fast_attempts => self.base_delay,
            BackoffKind::Fixed => self.max_delay.max(self.base_delay),
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .map_or(self.max_delay, |delay| delay.min(self.max_delay))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_filter: String,
    pub keepalive: Duration,
    pub tls: bool,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub reconnect: ReconnectPolicy,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            topic_filter: config.mqtt_topic.clone(),
            keepalive: config.mqtt_keepalive(),
            tls: config.mqtt_tls,
            ca_path: config.mqtt_ca_path.clone(),
            cert_path: config.mqtt_cert_path.clone(),
            key_path: config.mqtt_key_path.clone(),
            reconnect: config.reconnect_policy(),
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options.set_transport(self.transport()?);
        Ok(options)
    }

    fn transport(&self) -> Result<Transport> {
        if !self.tls {
            if self.ca_path.is_some() || self.cert_path.is_some() {
                tracing::warn!("MQTT TLS material configured but TLS is disabled; ignoring it");
            }
            return Ok(Transport::tcp());
        }

        let ca = match &self.ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT CA at {}", path.display()))?,
            ),
            None => None,
        };
        let client_auth = match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT client cert at {}", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT client key at {}", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => return Err(anyhow!("MQTT client certificate and key must be set together")),
        };

        match ca {
            None if client_auth.is_none() => Ok(Transport::tls_with_default_config()),
            None => Err(anyhow!("MQTT CA certificate is required with client certificates")),
            Some(ca) => Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            })),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct ManagerInner {
    settings: BrokerSettings,
    stats: Arc<IngestStats>,
    tx: mpsc::Sender<InboundMessage>,
    state: Mutex<ConnectionState>,
    attempt: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
    cancel: CancellationToken,
}

/// Owns the single broker session: connect, subscribe, forward publishes, reconnect.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        settings: BrokerSettings,
        tx: mpsc::Sender<InboundMessage>,
        stats: Arc<IngestStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                stats,
                tx,
                state: Mutex::new(ConnectionState::Disconnected),
                attempt: AtomicU32::new(0),
                task: Mutex::new(None),
                wake: Notify::new(),
                cancel,
            }),
        }
    }

    /// Spawns the connection task. Returns false when one is already running or the
    /// manager has been shut down.
    pub fn start(&self) -> bool {
        let Ok(mut task) = self.inner.task.lock() else {
            return false;
        };
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run().await }));
        true
    }

    /// Cuts the current backoff sleep short. No effect while connected.
    pub fn reconnect_now(&self) {
        if matches!(
            self.state(),
            ConnectionState::Reconnecting | ConnectionState::Disconnected
        ) {
            self.inner.wake.notify_one();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.stats.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.inner.stats.clone()
    }

    /// Stops the session and waits for the connection task to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error=%err, "MQTT connection task ended abnormally");
            }
        }
        self.inner.set_state(ConnectionState::Shutdown);
    }
}

impl ManagerInner {
    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    async fn run(self: Arc<Self>) {
        let filter = self.settings.topic_filter.clone();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let outcome = match self.settings.mqtt_options() {
                Ok(options) => {
                    let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
                    // Queued on the client; the event loop sends it after the CONNECT.
                    match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                        Ok(()) => {
                            let outcome = self.drive(&mut eventloop).await;
                            if matches!(outcome, SessionEnd::Shutdown) {
                                let _ = client.try_disconnect();
                                let _ = timeout(DISCONNECT_FLUSH, eventloop.poll()).await;
                            }
                            outcome
                        }
                        Err(err) => SessionEnd::Lost(format!("subscribe failed: {err}")),
                    }
                }
                Err(err) => SessionEnd::Lost(format!("{err:#}")),
            };
            self.stats.set_mqtt_connected(false);

            let reason = match outcome {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => reason,
            };
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let reconnects = self.stats.record_reconnect();
            self.stats.record_error(reason.clone());
            self.set_state(ConnectionState::Reconnecting);

            let delay = self.settings.reconnect.delay_for(attempt);
            tracing::warn!(
                error=%reason,
                attempt,
                reconnects,
                delay_ms = delay.as_millis() as u64,
                "MQTT connection lost; reconnecting"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.wake.notified() => {
                    tracing::info!("MQTT reconnect requested");
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        self.stats.set_mqtt_connected(false);
        self.set_state(ConnectionState::Shutdown);
        tracing::info!("MQTT connection manager stopped");
    }

    async fn drive(&self, eventloop: &mut EventLoop) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Shutdown,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    self.attempt.store(0, Ordering::SeqCst);
                    self.stats.set_mqtt_connected(true);
                    self.stats.clear_error();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(
                        host=%self.settings.host,
                        port=self.settings.port,
                        topic=%self.settings.topic_filter,
                        "MQTT connected"
                    );
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    tracing::debug!(pkid = ack.pkid, "MQTT subscription acknowledged");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => self.forward(publish).await,
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return SessionEnd::Lost("broker sent disconnect".to_string());
                }
                Ok(_) => {}
                Err(err) => return SessionEnd::Lost(err.to_string()),
            }
        }
    }

    async fn forward(&self, publish: Publish) {
        let received_at = Utc::now();
        self.stats.record_received(received_at);
        if let Err(err) = parse_sensor_topic(&publish.topic) {
            self.stats.record_rejected();
            tracing::warn!(error=%err, kind = err.kind(), "rejected MQTT message");
            return;
        }
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            received_at,
        };
        self.stats.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.stats.record_rejected();
            let err = IngestError::PipelineClosed;
            tracing::warn!(error=%err, kind = err.kind(), "dropping MQTT message");
        }
    }
}
