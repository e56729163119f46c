//! Server-side callbacks.

use std::net::SocketAddr;

use crate::message::{ConnId, Request};

/// Application logic behind a listening engine. Called from reactor threads
/// (`on_connect`, `on_disconnect`) and from reactor or worker threads
/// (`process`).
pub trait Handler<P>: Send + Sync + 'static {
    /// Access control for a fresh inbound connection. Returning `false`
    /// closes the socket without writing anything.
    fn on_connect(&self, _peer: SocketAddr, _local: SocketAddr) -> bool {
        true
    }

    /// Handles one request; call `request.reply` to answer it.
    fn process(&self, request: &mut Request<P>);

    fn on_disconnect(&self, _conn: ConnId, _peer: SocketAddr) {}
}

impl<P, F> Handler<P> for F
where
    F: Fn(&mut Request<P>) + Send + Sync + 'static,
{
    fn process(&self, request: &mut Request<P>) {
        self(request)
    }
}

/// Handler for engines that only send client requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoServer;

impl<P> Handler<P> for NoServer {
    fn on_connect(&self, _peer: SocketAddr, _local: SocketAddr) -> bool {
        false
    }

    fn process(&self, _request: &mut Request<P>) {}
}
