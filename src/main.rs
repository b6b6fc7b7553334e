use anyhow::{anyhow, Result};
use sensor_ingest::config::{Config, StoreBackend};
use sensor_ingest::http::{self, HttpState};
use sensor_ingest::ingest::{IngestDispatcher, RetryPolicy};
use sensor_ingest::mqtt::{BrokerSettings, ConnectionManager};
use sensor_ingest::pipeline::{self, spawn_worker, InboundMessage, IngestStats, Readiness, ReadyPipeline};
use sensor_ingest::status::StatusCalculator;
use sensor_ingest::store::{build_pool, MemorySensorStore, PgSensorStore, SensorStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn open_store(config: &Config) -> Result<Arc<dyn SensorStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory sensor store; data is lost on restart");
            Ok(Arc::new(MemorySensorStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("SENSOR_INGEST_DATABASE_URL is not set"))?;
            let pool = build_pool(url, config.db_pool_size).await?;
            let store = PgSensorStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

struct Workers {
    ingest: JoinHandle<()>,
    status: JoinHandle<Result<()>>,
}

/// Retries storage until it is reachable, then brings up the ingest side and the broker.
async fn bring_up(
    config: Config,
    stats: Arc<IngestStats>,
    readiness: Readiness,
    manager: ConnectionManager,
    rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) -> Option<Workers> {
    let store = loop {
        match open_store(&config).await {
            Ok(store) => break store,
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(
                    error=%reason,
                    retry_ms = config.store_retry_ms,
                    "sensor store unavailable; ingestion paused"
                );
                readiness.record_failure(reason);
                tokio::select! {
                    _ = tokio::time::sleep(config.store_retry_interval()) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    };

    let thresholds = config.status_thresholds();
    let dispatcher = IngestDispatcher::new(
        store.clone(),
        stats,
        thresholds,
        RetryPolicy {
            retries: config.persist_retries,
            base_delay: config.persist_retry_base(),
        },
    );
    let calculator = StatusCalculator::new(store, thresholds);
    readiness.mark_ready(ReadyPipeline {
        dispatcher: dispatcher.clone(),
        calculator: calculator.clone(),
    });
    tracing::info!(
        green = thresholds.green(),
        yellow = thresholds.yellow(),
        "sensor store ready"
    );

    let ingest = spawn_worker(dispatcher, rx, cancel.clone());
    let status = tokio::spawn(calculator.run(config.status_poll_interval(), cancel));
    manager.start();
    Some(Workers { ingest, status })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let cancel = CancellationToken::new();
    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = pipeline::channel(config.max_queue);
    let manager = ConnectionManager::new(
        BrokerSettings::from_config(&config),
        tx,
        stats.clone(),
        cancel.clone(),
    );
    let readiness = Readiness::new();
    if !config.config_errors.is_empty() {
        tracing::error!(errors=?config.config_errors, "running with default values for rejected settings");
        readiness.record_config_errors(&config.config_errors);
    }

    let listener = TcpListener::bind(&config.http_bind).await?;
    tracing::info!(addr=%config.http_bind, "HTTP listening");
    let app = http::router(HttpState {
        manager: manager.clone(),
        readiness: readiness.clone(),
    });
    let http_cancel = cancel.clone();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    let bring_up_handle = tokio::spawn(bring_up(
        config.clone(),
        stats,
        readiness,
        manager.clone(),
        rx,
        cancel.clone(),
    ));

    tokio::select! {
        res = &mut http_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    manager.shutdown().await;

    match bring_up_handle.await {
        Ok(Some(workers)) => {
            let grace = config.shutdown_grace();
            match tokio::time::timeout(grace, workers.ingest).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error=%err, "ingest worker failed"),
                Err(_) => tracing::warn!(
                    grace_ms = config.shutdown_grace_ms,
                    "ingest queue not drained within grace period"
                ),
            }
            match workers.status.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error=%err, "status task exited with error"),
                Err(err) => tracing::warn!(error=%err, "status task failed"),
            }
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(error=%err, "startup task failed"),
    }

    if !http_handle.is_finished() {
        let _ = http_handle.await;
    }
    if config.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }
    tracing::info!("sensor-ingest stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
