use crate::error::{IngestError, StoreError};
use crate::mqtt::{ConnectionManager, ConnectionState};
use crate::pipeline::{Readiness, StatsSnapshot};
use crate::store::{ReadingId, Sensor};
use crate::telemetry::SensorReading;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

type HttpError = (StatusCode, String);

#[derive(Clone)]
pub struct HttpState {
    pub manager: ConnectionManager,
    pub readiness: Readiness,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    connected: bool,
    state: ConnectionState,
    reconnect_attempt: u32,
    stats: StatsSnapshot,
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ReadingCreated {
    id: ReadingId,
}

async fn healthz(State(state): State<HttpState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.manager.stats().snapshot();
    let connected = state.manager.is_connected();
    let connection_state = state.manager.state();

    let reason = if let Some(reason) = state.readiness.config_error() {
        Some(reason.to_string())
    } else if state.readiness.pipeline().is_none() {
        Some(
            state
                .readiness
                .failure()
                .unwrap_or_else(|| "storage not ready".to_string()),
        )
    } else if connection_state == ConnectionState::Shutdown {
        Some("shutting down".to_string())
    } else if !connected {
        if !state.manager.start() {
            state.manager.reconnect_now();
        }
        Some(
            stats
                .last_error
                .clone()
                .unwrap_or_else(|| "broker disconnected".to_string()),
        )
    } else {
        None
    };

    let code = if reason.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = HealthResponse {
        status: if reason.is_some() { "unhealthy" } else { "healthy" },
        reason,
        connected,
        state: connection_state,
        reconnect_attempt: state.manager.reconnect_attempt(),
        stats,
    };
    (code, Json(body))
}

async fn list_sensors(State(state): State<HttpState>) -> Result<Json<Vec<Sensor>>, HttpError> {
    let pipeline = state.readiness.pipeline().ok_or_else(not_ready)?;
    let sensors = pipeline
        .calculator
        .list_sensors_fresh()
        .await
        .map_err(store_error)?;
    Ok(Json(sensors))
}

async fn sensor_readings(
    State(state): State<HttpState>,
    Path(sensor_id): Path<String>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Json<Vec<SensorReading>>, HttpError> {
    let pipeline = state.readiness.pipeline().ok_or_else(not_ready)?;
    let from = query.from.unwrap_or_default();
    let to = query.to.unwrap_or_else(Utc::now);
    if from > to {
        return Err((StatusCode::BAD_REQUEST, "`from` is after `to`".to_string()));
    }

    let store = pipeline.dispatcher.store();
    if store.get_sensor(&sensor_id).await.map_err(store_error)?.is_none() {
        return Err(store_error(StoreError::NotFound));
    }
    let readings = store
        .query_readings(&sensor_id, from, to)
        .await
        .map_err(store_error)?;
    Ok(Json(readings))
}

async fn post_reading(
    State(state): State<HttpState>,
    Json(record): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ReadingCreated>), HttpError> {
    let pipeline = state.readiness.pipeline().ok_or_else(not_ready)?;
    let id = pipeline
        .dispatcher
        .ingest_canonical(record)
        .await
        .map_err(ingest_error)?;
    Ok((StatusCode::CREATED, Json(ReadingCreated { id })))
}

fn not_ready() -> HttpError {
    store_error(StoreError::Unavailable("sensor store not ready".to_string()))
}

fn store_error(err: StoreError) -> HttpError {
    let code = match &err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Transient(_) | StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, err.to_string())
}

fn ingest_error(err: IngestError) -> HttpError {
    let code = match &err {
        IngestError::UnknownSensor(_) => StatusCode::NOT_FOUND,
        IngestError::Persistence { source, .. } if source.is_transient() => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        IngestError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        IngestError::PipelineClosed => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::MalformedTopic(_)
        | IngestError::MalformedPayload(_)
        | IngestError::MissingField(_)
        | IngestError::NonNumericField(_) => StatusCode::BAD_REQUEST,
    };
    (code, err.to_string())
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sensors", get(list_sensors))
        .route("/v1/sensors/{id}/readings", get(sensor_readings))
        .route("/v1/readings", post(post_reading))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
