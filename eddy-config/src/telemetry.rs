//! Logging and metrics configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[validate(custom(function = validation::validate_log_level))]
    pub log_level: String,

    /// Whether engine counters are recorded.
    pub metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            metrics: true,
        }
    }
}
