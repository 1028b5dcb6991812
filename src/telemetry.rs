//! Telemetry bootstrap.
//!
//! Installs the global tracing subscriber once, at process start. Log
//! levels follow `RUST_LOG`; without one, the fabric's own events log at
//! debug while dependencies stay at info, which keeps pipeline progress
//! visible during ingestion runs without drowning it in driver chatter.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tastevin=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .init();
}
