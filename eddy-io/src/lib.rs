//! # eddy-io
//!
//! Event-driven TCP engine: mio reactors, caller-supplied framing, request
//! dispatch to worker threads and client sessions with deadlines.
//!
//! ### Expectations (Production):
//! - Requests on one connection are answered in the order they arrived
//! - Every client request resolves exactly once (reply, timeout, cancel,
//!   connection loss or shutdown)
//! - A peer that stops reading pauses its own input, never the reactor
//!
//! ### Key Submodules:
//! - `codec`: Framing trait and the input/output views codecs work on
//! - `connection`: Per-socket buffers, backpressure and lifecycle
//! - `message`: Requests and the read batches that carry them
//! - `session`: Outstanding client requests and their timers
//! - `reactor`: The per-thread event loop
//! - `engine`: Public facade tying reactors and workers together

pub mod backpressure;
pub mod codec;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handler;
pub mod message;
mod reactor;
pub mod session;

pub use backpressure::{Backpressure, Unbounded, Watermark};
pub use codec::{Codec, Decoded, Input, OutChunk, OutputSink};
pub use connection::{ConnState, ConnStats, Connection, Role};
pub use engine::Eio;
pub use error::{ConnError, EngineError, ProtocolError, SessionError};
pub use handler::{Handler, NoServer};
pub use message::{ConnId, Message, Request};
pub use session::{Pending, SessionTable};
