//! ## eddy-io::session
//! **Outstanding client requests and their timers**
//!
//! Each reactor owns one [`SessionTable`]. A session is registered before its
//! request is written and retired exactly once: by a matching response, by its
//! deadline, by cancellation, or by the connection it was sent on closing.
//! Whoever retires it sends the outcome through the session's oneshot; every
//! later path finds nothing and does nothing.
//!
//! Deadlines live in a min-heap with lazy deletion. Entries retired by other
//! paths leave stale heap slots that are skipped when they surface.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use eddy_core::collections::HashTable;
use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::message::ConnId;

pub(crate) type SessionSender<P> = oneshot::Sender<Result<P, SessionError>>;

struct SessionEntry<P> {
    tx: SessionSender<P>,
    deadline: Instant,
    conn: Option<ConnId>,
    sent_at: Instant,
}

pub struct SessionTable<P> {
    entries: HashTable<SessionEntry<P>>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl<P> SessionTable<P> {
    pub fn new() -> Self {
        Self {
            entries: HashTable::with_capacity(1024),
            timers: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(id)
    }

    /// Registers session `id`. A duplicate id is answered with
    /// [`SessionError::Duplicate`] and not registered.
    pub fn insert(&mut self, id: u64, deadline: Instant, tx: SessionSender<P>) -> bool {
        if self.entries.contains_key(id) {
            let _ = tx.send(Err(SessionError::Duplicate));
            return false;
        }
        self.entries.insert(
            id,
            SessionEntry {
                tx,
                deadline,
                conn: None,
                sent_at: Instant::now(),
            },
        );
        self.timers.push(Reverse((deadline, id)));
        true
    }

    /// Records the connection the request went out on.
    pub fn bind(&mut self, id: u64, conn: ConnId) {
        if let Some(entry) = self.entries.find_mut(id) {
            entry.conn = Some(conn);
        }
    }

    /// Delivers a response read from `conn`. Returns the round-trip time, or
    /// `None` when no session `id` is waiting on that connection. A session
    /// sent on another connection stays outstanding.
    pub fn complete(&mut self, id: u64, conn: ConnId, packet: P) -> Option<Duration> {
        if self.entries.find(id)?.conn != Some(conn) {
            return None;
        }
        let entry = self.entries.remove(id)?;
        let elapsed = entry.sent_at.elapsed();
        let _ = entry.tx.send(Ok(packet));
        Some(elapsed)
    }

    /// Retires `id` with `err`. Returns whether it was outstanding.
    pub fn fail(&mut self, id: u64, err: SessionError) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, id: u64) -> bool {
        self.fail(id, SessionError::Cancelled)
    }

    /// Retires every session whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            let current = self.entries.find(id).map(|entry| entry.deadline);
            if current == Some(deadline) {
                self.fail(id, SessionError::Timeout);
                expired += 1;
            }
        }
        expired
    }

    /// Retires every session bound to `conn`.
    pub fn fail_conn(&mut self, conn: ConnId, err: SessionError) -> usize {
        let failed = self.entries.extract_if(|_, entry| entry.conn == Some(conn));
        let count = failed.len();
        for (_, entry) in failed {
            let _ = entry.tx.send(Err(err));
        }
        count
    }

    /// Retires everything.
    pub fn fail_all(&mut self, err: SessionError) -> usize {
        let all = self.entries.drain();
        let count = all.len();
        for (_, entry) in all {
            let _ = entry.tx.send(Err(err));
        }
        self.timers.clear();
        count
    }

    /// Earliest deadline still in the heap, stale or not.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

impl<P> Default for SessionTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for SessionTable<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("outstanding", &self.entries.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// Handle to one client request. Resolves exactly once.
#[derive(Debug)]
pub struct Pending<P> {
    id: u64,
    rx: oneshot::Receiver<Result<P, SessionError>>,
}

impl<P> Pending<P> {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Result<P, SessionError>>) -> Self {
        Self { id, rx }
    }

    /// A handle that is already resolved with `err`.
    pub(crate) fn failed(id: u64, err: SessionError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { id, rx }
    }

    /// Session id of the request, or 0 when the packet had none.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks the calling thread until the outcome arrives. Must not be
    /// called from inside an async runtime.
    pub fn blocking_wait(self) -> Result<P, SessionError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(SessionError::Shutdown))
    }
}

impl<P> Future for Pending<P> {
    type Output = Result<P, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SessionError::Shutdown)))
    }
}
