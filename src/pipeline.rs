use crate::ingest::IngestDispatcher;
use crate::status::StatusCalculator;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc, Mutex, OnceLock,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A publish handed from the broker connection to the processing task.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
    mpsc::channel(capacity.max(1))
}

/// Process-wide ingest counters. Counters only grow; they reset with the process.
#[derive(Debug)]
pub struct IngestStats {
    pub mqtt_connected: AtomicBool,
    pub messages_received: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub messages_persisted: AtomicU64,
    pub reconnect_count: AtomicU64,
    pub queue_depth: AtomicU64,
    last_message_unix_ms: AtomicI64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub connected: bool,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub messages_persisted: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub queue_depth: u64,
    pub last_error: Option<String>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_persisted: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            last_message_unix_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::SeqCst)
    }

    pub fn record_received(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::SeqCst);
        self.last_message_unix_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ms = self.last_message_unix_ms.load(Ordering::SeqCst);
        StatsSnapshot {
            connected: self.is_connected(),
            messages_received: self.messages_received.load(Ordering::SeqCst),
            messages_rejected: self.messages_rejected.load(Ordering::SeqCst),
            messages_persisted: self.messages_persisted.load(Ordering::SeqCst),
            last_message_at: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

/// Storage-backed half of the service, available once the store is reachable.
#[derive(Clone)]
pub struct ReadyPipeline {
    pub dispatcher: IngestDispatcher,
    pub calculator: StatusCalculator,
}

#[derive(Default)]
struct ReadinessInner {
    pipeline: OnceLock<ReadyPipeline>,
    failure: Mutex<Option<String>>,
    config_error: OnceLock<String>,
}

/// Startup state shared between the storage supervisor and the health endpoint.
#[derive(Clone, Default)]
pub struct Readiness {
    inner: Arc<ReadinessInner>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a pipeline was already installed.
    pub fn mark_ready(&self, pipeline: ReadyPipeline) -> bool {
        let installed = self.inner.pipeline.set(pipeline).is_ok();
        if installed {
            if let Ok(mut failure) = self.inner.failure.lock() {
                *failure = None;
            }
        }
        installed
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        if let Ok(mut failure) = self.inner.failure.lock() {
            *failure = Some(reason.into());
        }
    }

    /// Rejected settings stay reported for the life of the process; storage coming up
    /// does not clear them.
    pub fn record_config_errors(&self, errors: &[String]) {
        if !errors.is_empty() {
            let reason = format!("invalid configuration: {}", errors.join("; "));
            let _ = self.inner.config_error.set(reason);
        }
    }

    pub fn config_error(&self) -> Option<&str> {
        self.inner.config_error.get().map(String::as_str)
    }

    pub fn pipeline(&self) -> Option<&ReadyPipeline> {
        self.inner.pipeline.get()
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().ok().and_then(|f| f.clone())
    }
}

/// Processes inbound messages one at a time, which keeps per-connection arrival order.
///
/// On cancellation the channel is closed and whatever is already queued is drained
/// before the task exits; the caller bounds how long it waits for that.
pub fn spawn_worker(
    dispatcher: IngestDispatcher,
    mut rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stats = dispatcher.stats();
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
                    dispatcher.handle_inbound(&msg).await;
                }
                _ = cancel.cancelled() => {
                    rx.close();
                    let mut drained = 0u64;
                    while let Some(msg) = rx.recv().await {
                        stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
                        dispatcher.handle_inbound(&msg).await;
                        drained += 1;
                    }
                    tracing::info!(drained, "ingest worker drained queue on shutdown");
                    break;
                }
            }
        }
        tracing::info!("ingest worker stopped");
    })
}
