//! Group messaging configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct KfcConfig {
    /// Membership records, one `<host> role=.. group=.. port=..` per line.
    pub membership_file: Option<PathBuf>,

    /// Default policy for new agents.
    #[validate(custom(function = validation::validate_scheduler))]
    pub scheduler: String,

    #[validate(range(min = 1))]
    pub default_timeout_ms: u64,

    /// Weight of the newest sample in the response-time estimate.
    #[validate(range(min = 0.0, max = 1.0))]
    pub ewma_alpha: f64,

    /// Host names and addresses that identify this process in membership
    /// records.
    pub local_hosts: Vec<String>,
}

impl Default for KfcConfig {
    fn default() -> Self {
        Self {
            membership_file: None,
            scheduler: "round_robin".into(),
            default_timeout_ms: 1000,
            ewma_alpha: 0.2,
            local_hosts: vec!["127.0.0.1".into(), "localhost".into()],
        }
    }
}
