//! ## eddy-kfc::scheduler
//! **Server selection for client agents**
//!
//! A scheduler picks one of an agent's `n` servers for each request and may
//! learn from observed round trips. Agents can swap schedulers at runtime, so
//! every implementation is usable through `&self` from many threads.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Estimate assumed for a server with no samples yet.
const UNKNOWN_RTT: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    RoundRobin,
    Hashed,
    ResponseTime,
}

impl SchedulerKind {
    /// Builds a fresh scheduler over `servers` members.
    pub fn build(self, servers: usize, alpha: f64) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::RoundRobin => Box::new(RoundRobin::new(servers)),
            SchedulerKind::Hashed => Box::new(Hashed::new(servers)),
            SchedulerKind::ResponseTime => Box::new(ResponseTime::new(servers, alpha)),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "rr" => Ok(SchedulerKind::RoundRobin),
            "hashed" | "hash" => Ok(SchedulerKind::Hashed),
            "response_time" | "rt" => Ok(SchedulerKind::ResponseTime),
            other => Err(format!("unknown scheduler {other:?}")),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerKind::RoundRobin => "round_robin",
            SchedulerKind::Hashed => "hashed",
            SchedulerKind::ResponseTime => "response_time",
        })
    }
}

pub trait Scheduler: Send + Sync + fmt::Debug {
    fn kind(&self) -> SchedulerKind;

    /// Index of the server for a request carrying `key`.
    fn pick(&self, key: u64) -> usize;

    /// Feeds back the round trip of a request answered by `server`.
    fn observe(&self, _server: usize, _rtt: Duration) {}
}

/// Cycles servers in membership order.
#[derive(Debug)]
pub struct RoundRobin {
    servers: usize,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(servers: usize) -> Self {
        Self {
            servers: servers.max(1),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Scheduler for RoundRobin {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::RoundRobin
    }

    fn pick(&self, _key: u64) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.servers
    }
}

/// Same key, same server.
#[derive(Debug)]
pub struct Hashed {
    servers: usize,
}

impl Hashed {
    pub fn new(servers: usize) -> Self {
        Self {
            servers: servers.max(1),
        }
    }
}

impl Scheduler for Hashed {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Hashed
    }

    fn pick(&self, key: u64) -> usize {
        (key % self.servers as u64) as usize
    }
}

/// Weighted random choice favouring servers with a lower smoothed round
/// trip. Weights are the inverse of each server's estimate.
#[derive(Debug)]
pub struct ResponseTime {
    alpha: f64,
    estimates: Mutex<Vec<f64>>,
    rng: Mutex<SmallRng>,
}

impl ResponseTime {
    pub fn new(servers: usize, alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            estimates: Mutex::new(vec![0.0; servers.max(1)]),
            rng: Mutex::new(SmallRng::from_rng(&mut rand::rng())),
        }
    }

    /// Current smoothed round trip of `server` in seconds; zero before the
    /// first sample.
    pub fn estimate(&self, server: usize) -> f64 {
        self.estimates.lock().get(server).copied().unwrap_or(0.0)
    }
}

impl Scheduler for ResponseTime {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::ResponseTime
    }

    fn pick(&self, _key: u64) -> usize {
        let weights: Vec<f64> = self
            .estimates
            .lock()
            .iter()
            .map(|&e| 1.0 / if e > 0.0 { e } else { UNKNOWN_RTT })
            .collect();
        let total: f64 = weights.iter().sum();
        let mut point = self.rng.lock().random::<f64>() * total;
        for (index, weight) in weights.iter().enumerate() {
            if point < *weight {
                return index;
            }
            point -= weight;
        }
        weights.len() - 1
    }

    fn observe(&self, server: usize, rtt: Duration) {
        let sample = rtt.as_secs_f64();
        if let Some(estimate) = self.estimates.lock().get_mut(server) {
            *estimate = if *estimate == 0.0 {
                sample
            } else {
                self.alpha * sample + (1.0 - self.alpha) * *estimate
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_in_order() {
        let rr = SchedulerKind::RoundRobin.build(3, 0.2);
        let picks: Vec<usize> = (0..7).map(|k| rr.pick(k)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn hashed_is_stable_per_key() {
        let hashed = Hashed::new(4);
        assert_eq!(hashed.pick(10), hashed.pick(10));
        assert_eq!(hashed.pick(10), 2);
        let spread: std::collections::HashSet<usize> = (0..100).map(|k| hashed.pick(k)).collect();
        assert_eq!(spread.len(), 4);
    }

    #[test]
    fn ewma_tracks_samples() {
        let rt = ResponseTime::new(2, 0.5);
        rt.observe(0, Duration::from_millis(10));
        assert!((rt.estimate(0) - 0.010).abs() < 1e-9);
        rt.observe(0, Duration::from_millis(30));
        assert!((rt.estimate(0) - 0.020).abs() < 1e-9);
        rt.observe(5, Duration::from_millis(1));
        assert_eq!(rt.estimate(1), 0.0);
    }

    #[test]
    fn response_time_prefers_faster_servers() {
        let rt = ResponseTime::new(2, 0.2);
        rt.observe(0, Duration::from_millis(1));
        rt.observe(1, Duration::from_millis(50));
        let fast = (0..2000).filter(|&k| rt.pick(k) == 0).count();
        assert!(fast > 1800, "fast server picked {fast} of 2000 times");
    }

    #[test]
    fn kinds_parse_from_config_names() {
        for name in ["round_robin", "hashed", "response_time"] {
            let kind: SchedulerKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
            assert_eq!(kind.build(2, 0.2).kind(), kind);
        }
        assert!("fastest".parse::<SchedulerKind>().is_err());
    }
}
