//! ## eddy-kfc::agent
//! **Client handle bound to one group**
//!
//! An [`Agent`] picks a server for every request through its scheduler,
//! tags the request with a fresh channel id and keeps the engine's
//! [`Pending`] handle until the caller collects it with one of the `recv`
//! methods.
//!
//! ### Expectations (Production):
//! - `send` never blocks; transport failures surface on the matching `recv`
//! - A timed out channel is cancelled in the engine, so a late response is
//!   dropped by the reactor and never reaches a waiter
//! - `leave` returns only after every outstanding channel is retired

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use eddy_core::collections::HashTable;
use eddy_io::{Eio, Pending, SessionError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace};

use crate::codec::{group_id, KfcCodec, KfcPacket};
use crate::error::KfcError;
use crate::group::KfcServer;
use crate::scheduler::{Scheduler, SchedulerKind};

/// The engine every agent and served group of one process shares.
pub type KfcEngine = Eio<KfcCodec, KfcServer>;

const OUTSTANDING_BUCKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Joining = 0,
    Active = 1,
    Leaving = 2,
    Left = 3,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AgentState::Joining,
            1 => AgentState::Active,
            2 => AgentState::Leaving,
            _ => AgentState::Left,
        }
    }

    fn name(self) -> &'static str {
        match self {
            AgentState::Joining => "joining",
            AgentState::Active => "active",
            AgentState::Leaving => "leaving",
            AgentState::Left => "left",
        }
    }
}

struct Outstanding {
    pending: Pending<KfcPacket>,
    server: usize,
    sent_at: Instant,
}

pub struct Agent {
    id: u64,
    group: String,
    group_id: u64,
    servers: Vec<SocketAddr>,
    engine: Arc<KfcEngine>,
    scheduler: RwLock<Box<dyn Scheduler>>,
    alpha: f64,
    channels: Arc<AtomicU64>,
    outstanding: Mutex<HashTable<Outstanding>>,
    state: AtomicU8,
}

impl Agent {
    pub(crate) fn new(
        id: u64,
        group: &str,
        servers: Vec<SocketAddr>,
        engine: Arc<KfcEngine>,
        kind: SchedulerKind,
        alpha: f64,
        channels: Arc<AtomicU64>,
    ) -> Self {
        let agent = Self {
            id,
            group: group.to_owned(),
            group_id: group_id(group),
            scheduler: RwLock::new(kind.build(servers.len(), alpha)),
            servers,
            engine,
            alpha,
            channels,
            outstanding: Mutex::new(HashTable::with_capacity(OUTSTANDING_BUCKETS)),
            state: AtomicU8::new(AgentState::Joining as u8),
        };
        agent.set_state(AgentState::Active);
        agent
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Server addresses in membership order; scheduler indices refer to it.
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.scheduler.read().kind()
    }

    /// Channels sent but not yet collected.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn ensure_active(&self) -> Result<(), KfcError> {
        match self.state() {
            AgentState::Active => Ok(()),
            other => Err(KfcError::State(other.name())),
        }
    }

    /// Replaces the scheduling policy. Learned response times start over.
    pub fn choice_scheduler(&self, kind: SchedulerKind) {
        *self.scheduler.write() = kind.build(self.servers.len(), self.alpha);
        debug!(agent = self.id, group = %self.group, scheduler = %kind, "Scheduler changed");
    }

    /// Sends `payload` to the server the scheduler picks, keyed on the agent
    /// id. Returns the channel id to collect the response with.
    pub fn send(&self, payload: Bytes, timeout: Duration) -> Result<u64, KfcError> {
        self.send_keyed(self.id, payload, timeout)
    }

    /// Like [`Agent::send`] with an explicit scheduling key, so the hashed
    /// policy keeps every request for `key` on one server.
    pub fn send_keyed(&self, key: u64, payload: Bytes, timeout: Duration) -> Result<u64, KfcError> {
        // State is checked under the table lock so `leave` cannot drain
        // between the check and the insert.
        let mut outstanding = self.outstanding.lock();
        self.ensure_active()?;
        let server = self.scheduler.read().pick(key) % self.servers.len();
        let channel = self.channels.fetch_add(1, Ordering::Relaxed);
        let addr = self.servers[server];
        let packet = KfcPacket::request(self.group_id, channel, payload);

        let sent_at = Instant::now();
        let pending = self.engine.send(addr, packet, timeout);
        trace!(agent = self.id, channel, %addr, "Request sent");
        outstanding.insert(
            channel,
            Outstanding {
                pending,
                server,
                sent_at,
            },
        );
        Ok(channel)
    }

    /// Waits up to `timeout` for the response on `channel`.
    pub async fn recv_channel(&self, channel: u64, timeout: Duration) -> Result<Bytes, KfcError> {
        let outstanding = self
            .outstanding
            .lock()
            .remove(channel)
            .ok_or(KfcError::NoPending(channel))?;
        self.collect(channel, outstanding, timeout).await
    }

    /// Waits up to `timeout` for the response to the oldest outstanding
    /// request.
    pub async fn recv(&self, timeout: Duration) -> Result<Bytes, KfcError> {
        let oldest = self.outstanding.lock().pop_oldest();
        let (channel, outstanding) = oldest.ok_or(KfcError::NoPending(0))?;
        self.collect(channel, outstanding, timeout).await
    }

    /// Blocks the calling thread for the oldest outstanding response. The
    /// wait is bounded by the timeout given to `send`. Must not be called
    /// from inside an async runtime.
    pub fn recv_blocking(&self) -> Result<Bytes, KfcError> {
        let oldest = self.outstanding.lock().pop_oldest();
        let (channel, outstanding) = oldest.ok_or(KfcError::NoPending(0))?;
        let result = outstanding.pending.blocking_wait();
        self.settle(channel, outstanding.server, outstanding.sent_at, result)
    }

    async fn collect(
        &self,
        channel: u64,
        mut outstanding: Outstanding,
        timeout: Duration,
    ) -> Result<Bytes, KfcError> {
        let result = match tokio::time::timeout(timeout, &mut outstanding.pending).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        };
        self.settle(channel, outstanding.server, outstanding.sent_at, result)
    }

    fn settle(
        &self,
        channel: u64,
        server: usize,
        sent_at: Instant,
        result: Result<KfcPacket, SessionError>,
    ) -> Result<Bytes, KfcError> {
        let elapsed = sent_at.elapsed();
        match result {
            Ok(packet) => {
                self.scheduler.read().observe(server, elapsed);
                trace!(agent = self.id, channel, ?elapsed, "Response received");
                Ok(packet.payload)
            }
            Err(SessionError::Timeout) => {
                self.engine.cancel(channel);
                self.scheduler.read().observe(server, elapsed);
                let addr = self.servers[server];
                debug!(agent = self.id, channel, %addr, "Request timed out");
                Err(KfcError::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stops accepting sends, cancels every outstanding channel and waits
    /// for each to resolve.
    #[instrument(skip(self), fields(agent = self.id, group = %self.group))]
    pub async fn leave(&self) {
        let outstanding = {
            let mut table = self.outstanding.lock();
            if self.state() == AgentState::Left {
                return;
            }
            self.set_state(AgentState::Leaving);
            table.drain()
        };
        let count = outstanding.len();
        for (channel, _) in &outstanding {
            self.engine.cancel(*channel);
        }
        for (_, entry) in outstanding {
            let _ = entry.pending.await;
        }
        self.set_state(AgentState::Left);
        info!(cancelled = count, "Agent left");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        for (channel, _) in self.outstanding.get_mut().drain() {
            self.engine.cancel(channel);
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("servers", &self.servers)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_round_trip_through_the_atomic() {
        for state in [
            AgentState::Joining,
            AgentState::Active,
            AgentState::Leaving,
            AgentState::Left,
        ] {
            assert_eq!(AgentState::from_u8(state as u8), state);
        }
        assert_eq!(AgentState::Left.name(), "left");
    }
}
