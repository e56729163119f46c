//! Error types for membership handling and group messaging.

use std::io;
use std::net::SocketAddr;

use eddy_io::{EngineError, SessionError};
use thiserror::Error;

/// Problems with membership records or group registration. Reported before
/// any state is changed.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Failed to read membership file: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot resolve host {host}")]
    Resolve { host: String },

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Invalid access pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Peer {peer} is not allowed in group {group}")]
    AccessDenied { group: String, peer: SocketAddr },

    #[error("This host has no {role} record in group {group}")]
    NotAMember { group: String, role: &'static str },

    #[error("Group {0} has no servers")]
    NoServers(String),
}

#[derive(Debug, Error)]
pub enum KfcError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport failure: {0}")]
    Transport(SessionError),

    #[error("No outstanding request on channel {0}")]
    NoPending(u64),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Agent is {0}")]
    State(&'static str),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<SessionError> for KfcError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Timeout => KfcError::Timeout,
            other => KfcError::Transport(other),
        }
    }
}
