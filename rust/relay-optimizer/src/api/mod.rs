//! HTTP API Module
//!
//! Provides selection queries plus metrics and monitoring endpoints for the
//! optimizer.

mod routes;
mod metrics;

pub use routes::{router, run_api_server, ApiState};
pub use metrics::Metrics;
