//! ## eddy-telemetry::logging
//! **Subscriber bootstrap for binaries**
//!
//! Library crates only emit `tracing` events. A binary calls
//! [`EventLogger::init`] once; `RUST_LOG` wins over the configured level.
//! Thread names are printed so reactor (`eddy-io-N`) and worker
//! (`eddy-worker-N`) output can be told apart.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone, Debug)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global fmt subscriber. Fails if one is already set.
    pub fn init(default_level: &str) -> Result<(), InitError> {
        fmt()
            .with_env_filter(Self::filter(default_level))
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .try_init()
    }

    /// `RUST_LOG` if set and valid, otherwise `default_level`.
    pub fn filter(default_level: &str) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    }
}
