mod dispatcher;
mod retry;

#[cfg(test)]
mod tests;

pub use retry::RetryPolicy;

use crate::pipeline::IngestStats;
use crate::status::StatusThresholds;
use crate::store::SensorStore;
use std::sync::Arc;

/// Turns one inbound message into one persisted reading plus a freshness update.
///
/// Messages are handled strictly one after another by the pipeline worker; every
/// failure is contained here and only moves the rejection counter.
#[derive(Clone)]
pub struct IngestDispatcher {
    store: Arc<dyn SensorStore>,
    stats: Arc<IngestStats>,
    thresholds: StatusThresholds,
    retry: RetryPolicy,
}
