use thiserror::Error;

/// Per-message failure. Every variant is contained at the dispatcher boundary and
/// surfaces only as a rejection counter plus a log line.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("topic `{0}` does not match sensors/{{sensorId}}/data")]
    MalformedTopic(String),
    #[error("payload is not a JSON object: {0}")]
    MalformedPayload(String),
    #[error("payload is missing required key `{0}`")]
    MissingField(&'static str),
    #[error("payload key `{0}` is not a finite number")]
    NonNumericField(&'static str),
    #[error("unknown sensor `{0}`")]
    UnknownSensor(String),
    #[error("persistence failed after {attempts} attempt(s): {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("ingest pipeline is closed")]
    PipelineClosed,
}

impl IngestError {
    /// Short machine-friendly label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MalformedTopic(_) => "malformed_topic",
            IngestError::MalformedPayload(_) => "malformed_payload",
            IngestError::MissingField(_) => "missing_field",
            IngestError::NonNumericField(_) => "non_numeric_field",
            IngestError::UnknownSensor(_) => "unknown_sensor",
            IngestError::Persistence { .. } => "persistence",
            IngestError::PipelineClosed => "pipeline_closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Database(other),
        }
    }
}
