//! logwarden - log telemetry pipeline
//!
//! This crate turns loosely structured service logs into live alerts,
//! access-log statistics with nearest-rank percentiles, text/JSON/HTML
//! reports, and timestamped snapshots with retention.

pub mod config;
pub mod error;
pub mod logs;
