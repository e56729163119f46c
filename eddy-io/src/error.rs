//! Error types for the connection layer and engine lifecycle.

use std::io;
use std::net::SocketAddr;

use eddy_core::{AllocError, PoolError};
use eddy_telemetry::MetricsError;
use thiserror::Error;

/// Undecodable or unencodable data. Fatal to the one connection it occurs on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Decoder returned a packet without consuming input")]
    NoProgress,

    #[error("Output allocation failed: {0}")]
    Alloc(#[from] AllocError),
}

/// Socket-level failure on one connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Nothing to do until the next readiness event.
    #[error("Operation would block")]
    WouldBlock,

    #[error("Peer closed the connection")]
    Eof,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl ConnError {
    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnError::WouldBlock)
    }
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => ConnError::WouldBlock,
            _ => ConnError::Io(err),
        }
    }
}

/// Outcome of a client request other than a matched reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Could not connect to peer")]
    ConnectFailed,

    #[error("Engine shut down")]
    Shutdown,

    #[error("Session id already outstanding")]
    Duplicate,

    #[error("Packet carries no session id")]
    Unkeyed,

    #[error("Request could not be encoded")]
    Encode,
}

/// Engine construction and lifecycle failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Reactor setup failed: {0}")]
    Io(#[from] io::Error),

    #[error("Thread pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Engine is shutting down")]
    Stopped,
}
