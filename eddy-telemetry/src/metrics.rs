//! ## eddy-telemetry::metrics
//! **Prometheus counters for the I/O engine**
//!
//! One `MetricsRecorder` per engine, each with its own registry so several
//! engines in one process (tests, embedded servers) never collide.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub connections_accepted: IntCounter,
    pub connections_rejected: IntCounter,
    pub connections_active: IntGauge,
    pub requests: IntCounter,
    pub responses: IntCounter,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,
    pub session_timeouts: IntCounter,
    pub late_responses: IntCounter,
    pub protocol_errors: IntCounter,
    pub request_latency: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let connections_accepted =
            counter("eddy_connections_accepted_total", "Inbound connections accepted")?;
        let connections_rejected = counter(
            "eddy_connections_rejected_total",
            "Inbound connections refused by access control",
        )?;
        let requests = counter("eddy_requests_total", "Requests decoded on server connections")?;
        let responses = counter(
            "eddy_responses_total",
            "Responses matched to an outstanding client session",
        )?;
        let bytes_in = counter("eddy_bytes_in_total", "Bytes read from sockets")?;
        let bytes_out = counter("eddy_bytes_out_total", "Bytes written to sockets")?;
        let session_timeouts = counter(
            "eddy_session_timeouts_total",
            "Client sessions retired by their timer",
        )?;
        let late_responses = counter(
            "eddy_late_responses_total",
            "Responses dropped because no session was waiting",
        )?;
        let protocol_errors = counter(
            "eddy_protocol_errors_total",
            "Connections closed for undecodable input",
        )?;

        let connections_active =
            IntGauge::new("eddy_connections_active", "Connections currently open")?;
        registry.register(Box::new(connections_active.clone()))?;

        let request_latency = Histogram::with_opts(
            HistogramOpts::new(
                "eddy_request_latency_seconds",
                "Client round trip from send to matched response",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_rejected,
            connections_active,
            requests,
            responses,
            bytes_in,
            bytes_out,
            session_timeouts,
            late_responses,
            protocol_errors,
            request_latency,
        })
    }

    /// Text exposition of every metric in this recorder's registry.
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn connection_opened(&self) {
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn record_latency(&self, seconds: f64) {
        self.request_latency.observe(seconds);
    }
}
