//! ## eddy-io::reactor
//! **One event loop per I/O thread**
//!
//! Each reactor owns a `mio::Poll`, the connections registered with it and
//! the client sessions sent through it. Nothing a reactor owns is touched by
//! another thread; everything else reaches it through its [`Mailbox`]:
//! listeners to register, sockets accepted elsewhere, client sends, cancels,
//! and replies coming back from worker threads.
//!
//! Sockets are registered edge-triggered for both directions, so every
//! readiness event is drained until `WouldBlock`, and a connection whose
//! reads were paused is read again as soon as the pause lifts.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use eddy_config::IoConfig;
use eddy_core::alloc::{Allocator, Arena, DEFAULT_BLOCK_SIZE};
use eddy_core::collections::{hash_code, HashTable};
use eddy_core::thread::{TaskWorker, ThreadPool, Worker, WorkerContext};
use eddy_telemetry::MetricsRecorder;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::backpressure::Backpressure;
use crate::codec::{Codec, OutputSink};
use crate::connection::{ConnState, Connection, Role};
use crate::error::{ConnError, ProtocolError, SessionError};
use crate::handler::Handler;
use crate::message::{ConnId, Message, Reply};
use crate::session::{SessionSender, SessionTable};

/// Bits of a [`ConnId`] below the reactor index.
pub(crate) const CONN_SHIFT: u32 = 48;
const LOCAL_MASK: u64 = (1 << CONN_SHIFT) - 1;

pub(crate) const WAKE: Token = Token(usize::MAX);
const LISTENER_BASE: usize = usize::MAX - 1;

/// Stable key of a peer address, used to route sends and pool client
/// connections.
pub(crate) fn addr_key(addr: &SocketAddr) -> u64 {
    let mut bytes = [0u8; 18];
    match addr.ip() {
        IpAddr::V4(ip) => bytes[..4].copy_from_slice(&ip.octets()),
        IpAddr::V6(ip) => bytes[..16].copy_from_slice(&ip.octets()),
    }
    bytes[16..].copy_from_slice(&addr.port().to_be_bytes());
    hash_code(&bytes, 0)
}

pub(crate) enum Command<P> {
    Listen(TcpListener),
    Adopt {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Send {
        addr: SocketAddr,
        packet: P,
        id: u64,
        deadline: Instant,
        tx: SessionSender<P>,
    },
    Cancel {
        id: u64,
    },
    Reply(Reply<P>),
}

pub(crate) struct Mailbox<P> {
    queue: SegQueue<Command<P>>,
    waker: Waker,
}

impl<P> Mailbox<P> {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            queue: SegQueue::new(),
            waker,
        }
    }

    pub(crate) fn post(&self, command: Command<P>) {
        self.queue.push(command);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake reactor: {e}");
        }
    }

    fn pop(&self) -> Option<Command<P>> {
        self.queue.pop()
    }
}

/// State every reactor and worker thread of one engine reads.
pub(crate) struct Shared<C: Codec, H> {
    pub codec: C,
    pub handler: H,
    pub config: IoConfig,
    pub allocator: Arc<dyn Allocator>,
    pub metrics: Arc<MetricsRecorder>,
    pub backpressure: Arc<dyn Backpressure>,
    pub mailboxes: Vec<Mailbox<C::Packet>>,
    pub workers: Option<Arc<ThreadPool<TaskWorker>>>,
    pub draining: AtomicBool,
    accept_cursor: AtomicUsize,
}

impl<C: Codec, H: Handler<C::Packet>> Shared<C, H> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        codec: C,
        handler: H,
        config: IoConfig,
        allocator: Arc<dyn Allocator>,
        metrics: Arc<MetricsRecorder>,
        backpressure: Arc<dyn Backpressure>,
        mailboxes: Vec<Mailbox<C::Packet>>,
        workers: Option<Arc<ThreadPool<TaskWorker>>>,
    ) -> Self {
        Self {
            codec,
            handler,
            config,
            allocator,
            metrics,
            backpressure,
            mailboxes,
            workers,
            draining: AtomicBool::new(false),
            accept_cursor: AtomicUsize::new(0),
        }
    }

    /// Reactor that adopts the next accepted socket.
    fn next_reactor(&self) -> usize {
        let n = self.accept_cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        n % self.mailboxes.len()
    }
}

/// Pool slot running one reactor.
pub(crate) struct IoThread<C: Codec, H> {
    index: usize,
    shared: Arc<Shared<C, H>>,
    poll: Mutex<Option<Poll>>,
}

impl<C: Codec, H: Handler<C::Packet>> IoThread<C, H> {
    pub(crate) fn new(index: usize, shared: Arc<Shared<C, H>>, poll: Option<Poll>) -> Self {
        Self {
            index,
            shared,
            poll: Mutex::new(poll),
        }
    }
}

impl<C: Codec, H: Handler<C::Packet>> Worker for IoThread<C, H> {
    fn run(&self, ctx: &WorkerContext) {
        let Some(poll) = self.poll.lock().take() else {
            error!(reactor = self.index, "Reactor has no poll instance");
            return;
        };
        let mut reactor = Reactor::new(self.index, Arc::clone(&self.shared), poll);
        if let Err(e) = reactor.run(ctx) {
            error!(reactor = self.index, "Reactor failed: {e}");
        }
        reactor.shutdown();
    }

    fn wakeup(&self) {
        self.shared.mailboxes[self.index].wake();
    }
}

/// Per-reactor state that connection handling borrows alongside a
/// connection taken from the table.
struct Core<C: Codec, H> {
    index: usize,
    shared: Arc<Shared<C, H>>,
    sessions: SessionTable<C::Packet>,
}

struct Reactor<C: Codec, H> {
    core: Core<C, H>,
    poll: Poll,
    conns: HashTable<Connection<TcpStream>>,
    /// Client connections by peer, keyed by [`addr_key`].
    clients: HashTable<(SocketAddr, ConnId)>,
    listeners: Vec<Option<TcpListener>>,
    next_local: u64,
    drain_deadline: Option<Instant>,
}

impl<C: Codec, H: Handler<C::Packet>> Reactor<C, H> {
    fn new(index: usize, shared: Arc<Shared<C, H>>, poll: Poll) -> Self {
        Self {
            core: Core {
                index,
                shared,
                sessions: SessionTable::new(),
            },
            poll,
            conns: HashTable::with_capacity(1024),
            clients: HashTable::with_capacity(64),
            listeners: Vec::new(),
            next_local: 1,
            drain_deadline: None,
        }
    }

    fn run(&mut self, ctx: &WorkerContext) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        debug!(reactor = self.core.index, "Reactor running");
        loop {
            self.run_commands();

            if ctx.is_stopping() && self.drain_deadline.is_none() {
                self.begin_drain();
            }
            if let Some(deadline) = self.drain_deadline {
                if self.is_drained() {
                    debug!(reactor = self.core.index, "Reactor drained");
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(
                        reactor = self.core.index,
                        connections = self.conns.len(),
                        sessions = self.core.sessions.len(),
                        "Shutdown grace period elapsed"
                    );
                    return Ok(());
                }
            }

            let timeout = self.poll_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKE => {}
                    Token(t) if t > LISTENER_BASE - self.listeners.len() => {
                        self.accept(LISTENER_BASE - t);
                    }
                    Token(local) => {
                        let id = ((self.core.index as u64) << CONN_SHIFT) | local as u64;
                        let readable = event.is_readable() || event.is_read_closed();
                        let writable =
                            event.is_writable() || event.is_write_closed() || event.is_error();
                        let result = self.drive(id, readable, writable);
                        self.settle(id, result);
                    }
                }
            }

            let expired = self.core.sessions.expire(Instant::now());
            if expired > 0 {
                self.core
                    .shared
                    .metrics
                    .session_timeouts
                    .inc_by(expired as u64);
                debug!(reactor = self.core.index, expired, "Client sessions timed out");
            }
        }
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        let mut timeout = Duration::from_millis(self.core.shared.config.tick_ms);
        for deadline in [self.core.sessions.next_deadline(), self.drain_deadline]
            .into_iter()
            .flatten()
        {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn run_commands(&mut self) {
        let shared = Arc::clone(&self.core.shared);
        let mailbox = &shared.mailboxes[self.core.index];
        while let Some(command) = mailbox.pop() {
            match command {
                Command::Listen(listener) => self.listen(listener),
                Command::Adopt { stream, peer } => self.adopt(stream, peer),
                Command::Send {
                    addr,
                    packet,
                    id,
                    deadline,
                    tx,
                } => self.send(addr, packet, id, deadline, tx),
                Command::Cancel { id } => {
                    if self.core.sessions.cancel(id) {
                        debug!(session = id, "Client session cancelled");
                    }
                }
                Command::Reply(reply) => {
                    let id = reply.conn;
                    let result = match self.conns.find_mut(id) {
                        Some(conn) => {
                            conn.finish_dispatch();
                            write_reply(&self.core.shared, conn, reply)
                                .and_then(|()| self.core.pump(conn, false))
                        }
                        None => {
                            trace!(conn = id, "Dropping reply for closed connection");
                            Ok(())
                        }
                    };
                    self.settle(id, result);
                }
            }
        }
    }

    fn listen(&mut self, mut listener: TcpListener) {
        if self.drain_deadline.is_some() {
            return;
        }
        let token = Token(LISTENER_BASE - self.listeners.len());
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            error!(reactor = self.core.index, "Failed to register listener: {e}");
            return;
        }
        if let Ok(addr) = listener.local_addr() {
            info!(reactor = self.core.index, %addr, "Listening");
        }
        self.listeners.push(Some(listener));
    }

    fn accept(&mut self, slot: usize) {
        let shared = Arc::clone(&self.core.shared);
        let mut accepted = Vec::new();
        if let Some(Some(listener)) = self.listeners.get(slot) {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let local = match stream.local_addr() {
                            Ok(local) => local,
                            Err(e) => {
                                debug!(%peer, "Dropping accepted socket: {e}");
                                continue;
                            }
                        };
                        if !shared.handler.on_connect(peer, local) {
                            shared.metrics.connections_rejected.inc();
                            debug!(%peer, "Connection refused by access control");
                            continue;
                        }
                        shared.metrics.connections_accepted.inc();
                        accepted.push((stream, peer));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(reactor = self.core.index, "Accept failed: {e}");
                        break;
                    }
                }
            }
        }

        for (stream, peer) in accepted {
            let target = shared.next_reactor();
            if target == self.core.index {
                self.adopt(stream, peer);
            } else {
                shared.mailboxes[target].post(Command::Adopt { stream, peer });
            }
        }
    }

    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.drain_deadline.is_some() {
            return;
        }
        if let Err(e) = stream.set_nodelay(self.core.shared.config.tcp_nodelay) {
            debug!(%peer, "Failed to set TCP_NODELAY: {e}");
        }
        match self.register(stream, peer, Role::Server, ConnState::Established) {
            Ok(id) => {
                debug!(conn = id, %peer, "Connection accepted");
                let result = self.drive(id, true, false);
                self.settle(id, result);
            }
            Err(e) => warn!(%peer, "Failed to register connection: {e}"),
        }
    }

    fn register(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        role: Role,
        state: ConnState,
    ) -> io::Result<ConnId> {
        let local = self.next_local & LOCAL_MASK;
        self.next_local += 1;
        let id = ((self.core.index as u64) << CONN_SHIFT) | local;
        self.poll.registry().register(
            &mut stream,
            Token(local as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.conns
            .insert(id, Connection::new(id, stream, peer, role, state));
        self.core.shared.metrics.connection_opened();
        Ok(id)
    }

    /// Existing client connection to `addr`, or a new one in progress.
    fn client_for(&mut self, addr: SocketAddr) -> io::Result<ConnId> {
        let key = addr_key(&addr);
        if let Some(&(_, id)) = self.clients.find_by(key, |(peer, _)| *peer == addr) {
            let usable = self.conns.find(id).is_some_and(|conn| {
                matches!(conn.state(), ConnState::Connecting | ConnState::Established)
            });
            if usable {
                return Ok(id);
            }
        }
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(self.core.shared.config.tcp_nodelay) {
            trace!(%addr, "Failed to set TCP_NODELAY: {e}");
        }
        let id = self.register(stream, addr, Role::Client, ConnState::Connecting)?;
        self.clients.insert(key, (addr, id));
        debug!(conn = id, %addr, "Connecting");
        Ok(id)
    }

    fn send(
        &mut self,
        addr: SocketAddr,
        packet: C::Packet,
        id: u64,
        deadline: Instant,
        tx: SessionSender<C::Packet>,
    ) {
        if self.drain_deadline.is_some() {
            let _ = tx.send(Err(SessionError::Shutdown));
            return;
        }
        if !self.core.sessions.insert(id, deadline, tx) {
            debug!(session = id, "Duplicate session id");
            return;
        }
        let conn_id = match self.client_for(addr) {
            Ok(conn_id) => conn_id,
            Err(e) => {
                debug!(%addr, "Connect failed: {e}");
                self.core.sessions.fail(id, SessionError::ConnectFailed);
                return;
            }
        };
        self.core.sessions.bind(id, conn_id);

        let Some(conn) = self.conns.find_mut(conn_id) else {
            self.core.sessions.fail(id, SessionError::ConnectFailed);
            return;
        };
        let shared = &self.core.shared;
        let mut sink = OutputSink::new(shared.allocator.as_ref(), None);
        if let Err(e) = shared.codec.encode(&packet, &mut sink) {
            shared.metrics.protocol_errors.inc();
            warn!(session = id, "Failed to encode request: {e}");
            self.core.sessions.fail(id, SessionError::Encode);
            return;
        }
        conn.enqueue(sink.finish());
        let result = if conn.state() == ConnState::Established {
            self.core.pump(conn, false)
        } else {
            Ok(())
        };
        self.settle(conn_id, result);
    }

    /// Handles readiness on one connection.
    fn drive(&mut self, id: ConnId, readable: bool, writable: bool) -> Result<(), ConnError> {
        let Some(conn) = self.conns.find_mut(id) else {
            return Ok(());
        };
        if conn.state() == ConnState::Connecting {
            if !writable {
                return Ok(());
            }
            if let Some(e) = conn.stream().take_error()? {
                return Err(ConnError::Io(e));
            }
            match conn.stream().peer_addr() {
                Ok(_) => {
                    conn.establish();
                    debug!(conn = id, peer = %conn.peer(), "Connected");
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
        self.core.pump(conn, readable)
    }

    /// Closes `id` after a failure, or once it is closing and idle.
    fn settle(&mut self, id: ConnId, result: Result<(), ConnError>) {
        match result {
            Ok(()) | Err(ConnError::WouldBlock) => {
                let done = self
                    .conns
                    .find(id)
                    .is_some_and(|conn| conn.state() == ConnState::Closing && conn.is_idle());
                if done {
                    self.close(id, SessionError::ConnectionClosed);
                }
            }
            Err(ConnError::Protocol(e)) => {
                self.core.shared.metrics.protocol_errors.inc();
                warn!(conn = id, "Closing connection on protocol error: {e}");
                self.close(id, SessionError::ConnectionClosed);
            }
            Err(e) => {
                debug!(conn = id, "Connection failed: {e}");
                self.close(id, SessionError::ConnectionClosed);
            }
        }
    }

    fn close(&mut self, id: ConnId, err: SessionError) {
        let Some(mut conn) = self.conns.remove(id) else {
            return;
        };
        let err = if conn.state() == ConnState::Connecting {
            SessionError::ConnectFailed
        } else {
            err
        };
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            trace!(conn = id, "Deregister failed: {e}");
        }
        conn.mark_closed();
        let failed = self.core.sessions.fail_conn(id, err);
        let peer = conn.peer();
        match conn.role() {
            Role::Server => self.core.shared.handler.on_disconnect(id, peer),
            Role::Client => {
                self.clients.remove_by(addr_key(&peer), |&(_, conn)| conn == id);
            }
        }
        self.core.shared.metrics.connection_closed();
        let stats = conn.stats();
        debug!(
            conn = id,
            %peer,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            failed_sessions = failed,
            "Connection closed"
        );
    }

    fn begin_drain(&mut self) {
        let grace = Duration::from_millis(self.core.shared.config.shutdown_grace_ms);
        self.drain_deadline = Some(Instant::now() + grace);
        for mut listener in self.listeners.drain(..).flatten() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        let servers: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.role() == Role::Server)
            .map(|(id, _)| id)
            .collect();
        for id in servers {
            if let Some(conn) = self.conns.find_mut(id) {
                conn.begin_close();
            }
            self.settle(id, Ok(()));
        }
        info!(
            reactor = self.core.index,
            connections = self.conns.len(),
            sessions = self.core.sessions.len(),
            "Reactor draining"
        );
    }

    fn is_drained(&self) -> bool {
        self.core.sessions.is_empty()
            && self
                .conns
                .iter()
                .all(|(_, conn)| conn.role() == Role::Client && conn.is_idle())
    }

    /// Closes everything still open and answers every queued send.
    fn shutdown(&mut self) {
        let ids: Vec<ConnId> = self.conns.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.close(id, SessionError::Shutdown);
        }
        self.core.sessions.fail_all(SessionError::Shutdown);
        let shared = Arc::clone(&self.core.shared);
        while let Some(command) = shared.mailboxes[self.core.index].pop() {
            if let Command::Send { tx, .. } = command {
                let _ = tx.send(Err(SessionError::Shutdown));
            }
        }
        debug!(reactor = self.core.index, "Reactor stopped");
    }
}

impl<C: Codec, H: Handler<C::Packet>> Core<C, H> {
    /// Flushes output and reads whatever the socket holds, repeating while
    /// backpressure releases reads.
    fn pump(&mut self, conn: &mut Connection<TcpStream>, mut read: bool) -> Result<(), ConnError> {
        let shared = Arc::clone(&self.shared);
        loop {
            if conn.has_output() {
                let written = conn.flush()?;
                shared.metrics.bytes_out.inc_by(written as u64);
            }
            match conn.update_backpressure(shared.backpressure.as_ref()) {
                Some(true) => {
                    debug!(conn = conn.id(), queued = conn.queued_bytes(), "Reading paused");
                }
                Some(false) => {
                    debug!(conn = conn.id(), "Reading resumed");
                    read = true;
                }
                None => {}
            }
            if !read || !conn.wants_read() {
                return Ok(());
            }
            read = false;

            let outcome = conn.read_available(shared.config.read_chunk)?;
            shared.metrics.bytes_in.inc_by(outcome.bytes as u64);
            if conn.buffered() > 0 && conn.buffered() >= conn.need() {
                let arena = Arena::acquire(Arc::clone(&shared.allocator), DEFAULT_BLOCK_SIZE)
                    .map_err(ProtocolError::from)?;
                let packets = conn.decode(&shared.codec, &arena, shared.config.max_packet_size)?;
                if !packets.is_empty() {
                    match conn.role() {
                        Role::Server => self.dispatch(conn, arena, packets)?,
                        Role::Client => self.complete(conn.id(), packets),
                    }
                }
            }
            if outcome.eof {
                trace!(conn = conn.id(), "Peer closed its write side");
                conn.begin_close();
            }
        }
    }

    /// Hands one batch to the handler, inline or on the worker that owns
    /// the connection.
    fn dispatch(
        &mut self,
        conn: &mut Connection<TcpStream>,
        arena: Arena,
        packets: Vec<C::Packet>,
    ) -> Result<(), ConnError> {
        self.shared.metrics.requests.inc_by(packets.len() as u64);
        let first = conn.begin_dispatch(packets.len());
        let message = Message::new(
            conn.id(),
            conn.peer(),
            first,
            arena,
            packets,
            conn.closed_flag(),
        );
        match &self.shared.workers {
            Some(workers) => {
                let shared = Arc::clone(&self.shared);
                let index = self.index;
                workers.hash(conn.id()).submit(move || {
                    let reply = message.process(&shared.handler);
                    shared.mailboxes[index].post(Command::Reply(reply));
                });
                Ok(())
            }
            None => {
                let reply = message.process(&self.shared.handler);
                conn.finish_dispatch();
                write_reply(&self.shared, conn, reply)
            }
        }
    }

    fn complete(&mut self, conn: ConnId, packets: Vec<C::Packet>) {
        let metrics = &self.shared.metrics;
        for packet in packets {
            let Some(id) = self.shared.codec.session_id(&packet) else {
                metrics.protocol_errors.inc();
                warn!("Dropping response without a session id");
                continue;
            };
            match self.sessions.complete(id, conn, packet) {
                Some(rtt) => {
                    metrics.responses.inc();
                    metrics.record_latency(rtt.as_secs_f64());
                }
                None => {
                    metrics.late_responses.inc();
                    debug!(session = id, conn, "Dropping unmatched response");
                }
            }
        }
    }
}

/// Encodes the outputs of one batch onto its connection.
fn write_reply<C: Codec, H>(
    shared: &Shared<C, H>,
    conn: &mut Connection<TcpStream>,
    reply: Reply<C::Packet>,
) -> Result<(), ConnError> {
    for output in &reply.outputs {
        let mut sink = OutputSink::new(shared.allocator.as_ref(), Some(&reply.arena));
        shared.codec.encode(output, &mut sink)?;
        conn.enqueue(sink.finish());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_carry_their_reactor() {
        let id = (3u64 << CONN_SHIFT) | 17;
        assert_eq!(id >> CONN_SHIFT, 3);
        assert_eq!(id & LOCAL_MASK, 17);
    }

    #[test]
    fn address_keys_distinguish_ports_and_families() {
        let a: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:81".parse().unwrap();
        let c: SocketAddr = "[::ffff:10.0.0.1]:80".parse().unwrap();
        assert_eq!(addr_key(&a), addr_key(&a));
        assert_ne!(addr_key(&a), addr_key(&b));
        assert_ne!(addr_key(&a), addr_key(&c));
    }
}
