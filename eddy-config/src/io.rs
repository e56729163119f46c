//! Reactor and connection configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    /// Reactor threads; each owns a disjoint set of connections.
    #[validate(range(min = 1, max = 256))]
    pub io_threads: usize,

    /// Handler threads. Zero processes requests inline on the reactor.
    #[validate(range(max = 1024))]
    pub worker_threads: usize,

    /// Bytes requested from the socket per read.
    #[serde(with = "crate::size")]
    #[validate(range(min = 256, max = 16777216))]
    pub read_chunk: usize,

    /// Largest frame a codec may ask the connection to buffer.
    #[serde(with = "crate::size")]
    #[validate(range(min = 64))]
    pub max_packet_size: usize,

    #[validate(nested)]
    pub backpressure: BackpressureConfig,

    /// How long `stop` lets in-flight work and queued output drain.
    pub shutdown_grace_ms: u64,

    pub tcp_nodelay: bool,

    /// Longest the reactor sleeps in one poll when no timer is due sooner.
    #[validate(range(min = 1, max = 1000))]
    pub tick_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            io_threads: num_cpus::get().clamp(1, 4),
            worker_threads: 0,
            read_chunk: 8 << 10,
            max_packet_size: 16 << 20,
            backpressure: BackpressureConfig::default(),
            shutdown_grace_ms: 2000,
            tcp_nodelay: true,
            tick_ms: 100,
        }
    }
}

/// Output-queue thresholds, in bytes, for pausing and resuming reads.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
#[validate(schema(function = validation::validate_watermarks))]
pub struct BackpressureConfig {
    #[serde(with = "crate::size")]
    pub high_watermark: usize,

    #[serde(with = "crate::size")]
    pub low_watermark: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1 << 20,
            low_watermark: 256 << 10,
        }
    }
}
