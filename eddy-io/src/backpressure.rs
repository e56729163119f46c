//! ## eddy-io::backpressure
//! **Read throttling on stalled peers**
//!
//! A connection whose output queue grows past a threshold stops reading until
//! the queue drains, so one slow peer holds a bounded amount of memory. The
//! thresholds are a policy object so deployments can swap the rule without
//! touching the reactor.

use std::fmt;

use eddy_config::BackpressureConfig;

pub trait Backpressure: Send + Sync + fmt::Debug {
    /// Whether reading should be paused with `queued` output bytes pending,
    /// given the current `paused` state.
    fn should_pause(&self, queued: usize, paused: bool) -> bool;
}

/// Pause above `high`, resume once the queue is below `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub high: usize,
    pub low: usize,
}

impl Backpressure for Watermark {
    fn should_pause(&self, queued: usize, paused: bool) -> bool {
        if paused {
            queued >= self.low
        } else {
            queued > self.high
        }
    }
}

impl From<&BackpressureConfig> for Watermark {
    fn from(config: &BackpressureConfig) -> Self {
        Self {
            high: config.high_watermark,
            low: config.low_watermark,
        }
    }
}

/// Never pauses. Useful for peers that are trusted to drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl Backpressure for Unbounded {
    fn should_pause(&self, _queued: usize, _paused: bool) -> bool {
        false
    }
}
