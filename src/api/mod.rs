//! HTTP API Module
//!
//! Read-only status, peer list and metrics endpoints for the crawler.

mod metrics;
mod routes;

pub use metrics::Metrics;
pub use routes::{router, run_api_server, ApiState};
