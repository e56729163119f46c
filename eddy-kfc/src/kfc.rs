//! ## eddy-kfc::kfc
//! **Process-wide entry point for group messaging**
//!
//! One [`Kfc`] owns the membership, the served group table and a single
//! engine shared by every served group and every agent in the process.
//! Membership problems are reported before anything is registered or bound.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eddy_config::{EddyConfig, IoConfig, KfcConfig, MemoryConfig};
use eddy_core::alloc::{Allocator, SlabAllocator, Zone};
use eddy_io::{EngineError, Eio};
use eddy_telemetry::MetricsRecorder;
use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::agent::{Agent, KfcEngine};
use crate::codec::KfcCodec;
use crate::error::{KfcError, MembershipError};
use crate::group::{GroupHandler, GroupTable, KfcServer};
use crate::membership::{Member, Membership};
use crate::scheduler::SchedulerKind;

pub struct Kfc {
    membership: Membership,
    config: KfcConfig,
    engine: Arc<KfcEngine>,
    groups: Arc<RwLock<GroupTable>>,
    /// Membership address and the address actually bound for it.
    listening: Mutex<Vec<(SocketAddr, SocketAddr)>>,
    channels: Arc<AtomicU64>,
    next_agent: AtomicU64,
}

impl Kfc {
    pub fn create(
        membership: Membership,
        config: KfcConfig,
        io: IoConfig,
        allocator: Arc<dyn Allocator>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, KfcError> {
        let groups = Arc::new(RwLock::new(GroupTable::new()));
        let codec = KfcCodec::new(io.max_packet_size);
        let engine = Eio::new(
            codec,
            KfcServer::new(Arc::clone(&groups)),
            io,
            allocator,
            metrics,
        )?;
        info!(
            members = membership.len(),
            groups = membership.groups().len(),
            "KFC created"
        );
        Ok(Self {
            membership,
            config,
            engine: Arc::new(engine),
            groups,
            listening: Mutex::new(Vec::new()),
            channels: Arc::new(AtomicU64::new(1)),
            next_agent: AtomicU64::new(1),
        })
    }

    /// Builds the slab allocator, metrics and membership described by
    /// `config`. Without a membership file the membership is empty.
    pub fn from_config(config: &EddyConfig) -> Result<Self, KfcError> {
        let membership = match &config.kfc.membership_file {
            Some(path) => Membership::load(path)?,
            None => Membership::default(),
        };
        let allocator = slab_allocator(&config.memory)?;
        let metrics = MetricsRecorder::new().map_err(EngineError::from)?;
        Self::create(
            membership,
            config.kfc.clone(),
            config.io.clone(),
            allocator,
            Arc::new(metrics),
        )
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn engine(&self) -> &Arc<KfcEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        self.engine.metrics()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.default_timeout_ms)
    }

    fn is_local(&self, member: &Member) -> bool {
        self.config.local_hosts.iter().any(|host| *host == member.host)
    }

    fn known_group(&self, group: &str) -> Result<(), MembershipError> {
        if self.membership.contains_group(group) {
            Ok(())
        } else {
            Err(MembershipError::UnknownGroup(group.to_owned()))
        }
    }

    /// Serves `group` with `handler` on every local server record of the
    /// group. Returns the bound addresses.
    #[instrument(skip(self, handler))]
    pub fn join_server(
        &self,
        group: &str,
        handler: impl GroupHandler,
    ) -> Result<Vec<SocketAddr>, KfcError> {
        self.known_group(group)?;
        let mut wanted = Vec::new();
        for member in self.membership.servers(group).filter(|m| self.is_local(m)) {
            let addr = member.resolve()?;
            if !wanted.contains(&addr) {
                wanted.push(addr);
            }
        }
        if wanted.is_empty() {
            return Err(MembershipError::NotAMember {
                group: group.to_owned(),
                role: "server",
            }
            .into());
        }

        self.groups.write().serve(group, Arc::new(handler));
        match self.bind_all(&wanted) {
            Ok(bound) => {
                info!(?bound, "Serving group");
                Ok(bound)
            }
            Err(e) => {
                self.groups.write().withdraw(group);
                Err(e.into())
            }
        }
    }

    /// Binds every address not already bound by an earlier group.
    fn bind_all(&self, wanted: &[SocketAddr]) -> Result<Vec<SocketAddr>, EngineError> {
        let mut listening = self.listening.lock();
        let mut bound = Vec::with_capacity(wanted.len());
        for addr in wanted {
            let existing = listening.iter().find(|(want, _)| want == addr).map(|(_, b)| *b);
            let local = match existing {
                Some(local) => local,
                None => {
                    let local = self.engine.listen(*addr)?;
                    listening.push((*addr, local));
                    local
                }
            };
            bound.push(local);
        }
        Ok(bound)
    }

    /// Allows or denies clients matching `pattern` in `group`. The most
    /// recent matching rule decides; peers no rule matches are allowed.
    pub fn allow_client(&self, group: &str, pattern: &str, enabled: bool) -> Result<(), KfcError> {
        self.known_group(group)?;
        self.groups.write().allow(group, pattern, enabled)?;
        info!(group, pattern, enabled, "Access rule set");
        Ok(())
    }

    /// Returns an agent over the servers of `group`. This host needs a
    /// client record in the group.
    #[instrument(skip(self))]
    pub fn join_client(&self, group: &str) -> Result<Agent, KfcError> {
        self.known_group(group)?;
        if !self.membership.clients(group).any(|m| self.is_local(m)) {
            return Err(MembershipError::NotAMember {
                group: group.to_owned(),
                role: "client",
            }
            .into());
        }

        let mut servers = Vec::new();
        for member in self.membership.servers(group) {
            let addr = member.resolve()?;
            if !servers.contains(&addr) {
                servers.push(addr);
            }
        }
        if servers.is_empty() {
            return Err(MembershipError::NoServers(group.to_owned()).into());
        }

        let kind = self.config.scheduler.parse().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to round robin");
            SchedulerKind::RoundRobin
        });
        let id = self.next_agent.fetch_add(1, Ordering::Relaxed);
        let agent = Agent::new(
            id,
            group,
            servers,
            Arc::clone(&self.engine),
            kind,
            self.config.ewma_alpha,
            Arc::clone(&self.channels),
        );
        info!(agent = id, servers = agent.servers().len(), scheduler = %kind, "Agent joined");
        Ok(agent)
    }

    pub fn start(&self) -> Result<(), KfcError> {
        self.engine.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Blocks until the engine has drained and every thread is joined.
    pub fn wait(&self) {
        self.engine.wait();
    }
}

impl std::fmt::Debug for Kfc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kfc")
            .field("members", &self.membership.len())
            .field("served", &self.groups.read().served())
            .field("engine", &self.engine)
            .finish()
    }
}

/// Zone and slab caches shaped by `memory`.
pub fn slab_allocator(memory: &MemoryConfig) -> Result<Arc<dyn Allocator>, EngineError> {
    let zone = Zone::with_geometry(memory.zone_max_bytes, memory.page_shift, memory.max_order)?;
    let allocator = SlabAllocator::new(
        Arc::new(zone),
        memory.slab_min_object,
        memory.slab_max_object,
        memory.slab_free_limit,
    )?;
    allocator.set_memlimit(memory.memlimit);
    Ok(Arc::new(allocator))
}
