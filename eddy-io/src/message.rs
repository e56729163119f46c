//! ## eddy-io::message
//! **Requests and the read batches that carry them**
//!
//! Every read on a server connection that decodes at least one packet yields
//! one [`Message`]: the decoded packets as [`Request`]s plus the [`Arena`]
//! they were decoded into. The message is the unit handed to a worker, so all
//! requests of one batch are processed in order by one thread, and a batch's
//! replies come back together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eddy_core::alloc::Arena;

/// Engine-wide connection id. The top 16 bits name the owning reactor.
pub type ConnId = u64;

/// One decoded packet awaiting a reply.
#[derive(Debug)]
pub struct Request<P> {
    conn: ConnId,
    peer: SocketAddr,
    seq: u64,
    arena: Arena,
    input: Option<P>,
    output: Option<P>,
    closed: Arc<AtomicBool>,
}

impl<P> Request<P> {
    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Position of this request among all requests on its connection.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Arena the input was decoded into; replies may allocate from it too.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn input(&self) -> Option<&P> {
        self.input.as_ref()
    }

    pub fn take_input(&mut self) -> Option<P> {
        self.input.take()
    }

    /// Sets the packet written back on this request's connection. A second
    /// call replaces the first.
    pub fn reply(&mut self, packet: P) {
        self.output = Some(packet);
    }

    pub fn output(&self) -> Option<&P> {
        self.output.as_ref()
    }

    /// True once the connection is torn down; any reply will be discarded.
    pub fn is_connection_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Requests decoded from one read batch.
#[derive(Debug)]
pub struct Message<P> {
    conn: ConnId,
    arena: Arena,
    requests: Vec<Request<P>>,
}

/// Outputs produced for one message, in request order.
#[derive(Debug)]
pub(crate) struct Reply<P> {
    pub conn: ConnId,
    pub arena: Arena,
    pub outputs: Vec<P>,
}

impl<P> Message<P> {
    pub(crate) fn new(
        conn: ConnId,
        peer: SocketAddr,
        first_seq: u64,
        arena: Arena,
        packets: Vec<P>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let requests = packets
            .into_iter()
            .zip(first_seq..)
            .map(|(packet, seq)| Request {
                conn,
                peer,
                seq,
                arena: arena.retain(),
                input: Some(packet),
                output: None,
                closed: Arc::clone(&closed),
            })
            .collect();
        Self {
            conn,
            arena,
            requests,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[Request<P>] {
        &self.requests
    }

    /// Runs `handler` over every request in order. Stops early once the
    /// connection is closed.
    pub(crate) fn process<H: crate::Handler<P> + ?Sized>(self, handler: &H) -> Reply<P> {
        let mut outputs = Vec::with_capacity(self.requests.len());
        for mut request in self.requests {
            if request.is_connection_closed() {
                break;
            }
            handler.process(&mut request);
            if let Some(output) = request.output.take() {
                outputs.push(output);
            }
        }
        Reply {
            conn: self.conn,
            arena: self.arena,
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::alloc::{Allocator, SystemAllocator};

    fn message(packets: Vec<u32>) -> (Message<u32>, Arc<AtomicBool>) {
        let allocator: Arc<dyn Allocator> = Arc::new(SystemAllocator::new());
        let arena = Arena::acquire(allocator, 256).unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let peer = "127.0.0.1:9".parse().unwrap();
        (
            Message::new(7, peer, 10, arena, packets, Arc::clone(&closed)),
            closed,
        )
    }

    #[test]
    fn requests_share_the_batch_arena_and_keep_order() {
        let (message, _) = message(vec![1, 2, 3]);
        assert_eq!(message.len(), 3);
        assert_eq!(message.requests()[2].seq(), 12);
        assert_eq!(message.requests()[0].arena().ref_count(), 4);

        let reply = message.process(&|request: &mut Request<u32>| {
            let doubled = request.input().copied().unwrap_or(0) * 2;
            if doubled != 4 {
                request.reply(doubled);
            }
        });
        assert_eq!(reply.conn, 7);
        assert_eq!(reply.outputs, vec![2, 6]);
        assert_eq!(reply.arena.ref_count(), 1);
    }

    #[test]
    fn closed_connection_stops_processing() {
        let (message, closed) = message(vec![1, 2]);
        closed.store(true, Ordering::Release);
        let reply = message.process(&|request: &mut Request<u32>| request.reply(0));
        assert!(reply.outputs.is_empty());
    }
}
