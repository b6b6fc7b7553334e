pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod mqtt;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod telemetry;
