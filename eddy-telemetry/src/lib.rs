//! # Eddy Telemetry
//!
//! Logging bootstrap and Prometheus counters for the engine.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
pub use prometheus::Error as MetricsError;
