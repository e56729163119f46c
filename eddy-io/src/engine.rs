//! ## eddy-io::engine
//! **The I/O engine facade**
//!
//! [`Eio`] wires a codec and a handler to a pool of reactors and an optional
//! pool of worker threads. One engine can listen on any number of addresses
//! and send client requests at the same time.
//!
//! ### Expectations (Production):
//! - `listen` reports bind failures synchronously
//! - `send` never blocks; its outcome always arrives through the returned
//!   [`Pending`]
//! - `stop` stops accepting at once and lets in-flight work drain for at
//!   most `shutdown_grace_ms`

use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eddy_config::IoConfig;
use eddy_core::alloc::Allocator;
use eddy_core::thread::{TaskWorker, ThreadPool};
use eddy_telemetry::MetricsRecorder;
use mio::net::TcpListener;
use mio::{Poll, Waker};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::backpressure::{Backpressure, Watermark};
use crate::codec::Codec;
use crate::error::{EngineError, SessionError};
use crate::handler::Handler;
use crate::reactor::{addr_key, Command, IoThread, Mailbox, Shared, WAKE};
use crate::session::Pending;

pub struct Eio<C: Codec, H: Handler<C::Packet>> {
    shared: Arc<Shared<C, H>>,
    io: ThreadPool<IoThread<C, H>>,
    workers: Option<Arc<ThreadPool<TaskWorker>>>,
    listen_cursor: AtomicUsize,
}

impl<C: Codec, H: Handler<C::Packet>> Eio<C, H> {
    /// Builds an engine that throttles reads by the configured watermarks.
    pub fn new(
        codec: C,
        handler: H,
        config: IoConfig,
        allocator: Arc<dyn Allocator>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, EngineError> {
        let policy = Arc::new(Watermark::from(&config.backpressure));
        Self::with_policy(codec, handler, config, allocator, metrics, policy)
    }

    pub fn with_policy(
        codec: C,
        handler: H,
        config: IoConfig,
        allocator: Arc<dyn Allocator>,
        metrics: Arc<MetricsRecorder>,
        backpressure: Arc<dyn Backpressure>,
    ) -> Result<Self, EngineError> {
        let count = config.io_threads.max(1);
        let mut polls = Vec::with_capacity(count);
        let mut mailboxes = Vec::with_capacity(count);
        for _ in 0..count {
            let poll = Poll::new()?;
            mailboxes.push(Mailbox::new(Waker::new(poll.registry(), WAKE)?));
            polls.push(poll);
        }

        let workers = match config.worker_threads {
            0 => None,
            n => Some(Arc::new(ThreadPool::create("eddy-worker", n, |_| {
                TaskWorker::new()
            })?)),
        };

        let shared = Arc::new(Shared::new(
            codec,
            handler,
            config,
            allocator,
            metrics,
            backpressure,
            mailboxes,
            workers.clone(),
        ));
        let mut polls = polls.into_iter();
        let io = ThreadPool::create("eddy-io", count, |index| {
            IoThread::new(index, Arc::clone(&shared), polls.next())
        })?;

        Ok(Self {
            shared,
            io,
            workers,
            listen_cursor: AtomicUsize::new(0),
        })
    }

    /// Starts worker threads, then reactors.
    pub fn start(&self) -> Result<(), EngineError> {
        if let Some(workers) = &self.workers {
            workers.start()?;
        }
        self.io.start()?;
        info!(
            io_threads = self.io.count(),
            worker_threads = self.workers.as_ref().map_or(0, |w| w.count()),
            "Engine started"
        );
        Ok(())
    }

    /// Binds `addr` and hands the listener to a reactor. Returns the bound
    /// address, which differs from `addr` when it named port 0.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EngineError> {
        if self.is_stopping() {
            return Err(EngineError::Stopped);
        }
        let listener =
            StdListener::bind(addr).map_err(|source| EngineError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let index = self.listen_cursor.fetch_add(1, Ordering::Relaxed) % self.io.count();
        self.shared.mailboxes[index].post(Command::Listen(TcpListener::from_std(listener)));
        debug!(%local, reactor = index, "Listener queued");
        Ok(local)
    }

    /// Sends `packet` to `addr` as a client request. The returned handle
    /// resolves with the response whose session id matches, or with the
    /// reason none will arrive.
    pub fn send(
        &self,
        addr: SocketAddr,
        packet: C::Packet,
        timeout: Duration,
    ) -> Pending<C::Packet> {
        let Some(id) = self.shared.codec.session_id(&packet) else {
            return Pending::failed(0, SessionError::Unkeyed);
        };
        if self.is_stopping() {
            return Pending::failed(id, SessionError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        let index = (addr_key(&addr) % self.io.count() as u64) as usize;
        self.shared.mailboxes[index].post(Command::Send {
            addr,
            packet,
            id,
            deadline: Instant::now() + timeout,
            tx,
        });
        Pending::new(id, rx)
    }

    /// Retires session `id` with [`SessionError::Cancelled`] if it is still
    /// outstanding.
    pub fn cancel(&self, id: u64) {
        for mailbox in &self.shared.mailboxes {
            mailbox.post(Command::Cancel { id });
        }
    }

    /// Stops accepting and begins draining. Does not wait.
    pub fn stop(&self) {
        if !self.shared.draining.swap(true, Ordering::AcqRel) {
            info!("Engine stopping");
        }
        self.io.stop();
    }

    /// Joins reactors, then worker threads.
    pub fn wait(&self) {
        self.io.join();
        if let Some(workers) = &self.workers {
            workers.stop();
            workers.join();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &IoConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.shared.metrics
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.shared.allocator
    }

    pub fn codec(&self) -> &C {
        &self.shared.codec
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }
}

impl<C: Codec, H: Handler<C::Packet>> Drop for Eio<C, H> {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

impl<C: Codec, H: Handler<C::Packet>> std::fmt::Debug for Eio<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eio")
            .field("io", &self.io)
            .field("workers", &self.workers)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
