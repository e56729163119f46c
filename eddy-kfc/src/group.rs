//! ## eddy-kfc::group
//! **Served groups and the server-side request handler**
//!
//! The [`GroupTable`] maps group names to their access list and, for groups
//! this process serves, the handler requests are routed to. It sits behind a
//! read-mostly lock: every inbound connection and request reads it, only
//! `join_server` and `allow_client` write.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use eddy_core::collections::StringTable;
use eddy_io::{Handler, Request};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::acl::AccessList;
use crate::codec::{KfcPacket, PacketKind};
use crate::error::MembershipError;

/// Application logic of one served group. Returning `None` sends no
/// response; the client sees its request time out.
pub trait GroupHandler: Send + Sync + 'static {
    fn process(&self, request: &KfcPacket, peer: SocketAddr) -> Option<Bytes>;
}

impl<F> GroupHandler for F
where
    F: Fn(&KfcPacket) -> Option<Bytes> + Send + Sync + 'static,
{
    fn process(&self, request: &KfcPacket, _peer: SocketAddr) -> Option<Bytes> {
        self(request)
    }
}

#[derive(Default)]
struct GroupEntry {
    acl: AccessList,
    handler: Option<Arc<dyn GroupHandler>>,
}

#[derive(Default)]
pub struct GroupTable {
    groups: StringTable<GroupEntry>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<R>(&mut self, name: &str, f: impl FnOnce(&mut GroupEntry) -> R) -> R {
        let mut entry = self.groups.remove(name).unwrap_or_default();
        let result = f(&mut entry);
        self.groups.insert(name, entry);
        result
    }

    /// Routes requests for `name` to `handler`, replacing any earlier one.
    pub fn serve(&mut self, name: &str, handler: Arc<dyn GroupHandler>) {
        self.update(name, |entry| entry.handler = Some(handler));
    }

    /// Stops routing to `name`; its access list is kept.
    pub fn withdraw(&mut self, name: &str) {
        if let Some(entry) = self.groups.get_mut(name) {
            entry.handler = None;
        }
    }

    pub fn allow(
        &mut self,
        name: &str,
        pattern: &str,
        enabled: bool,
    ) -> Result<(), MembershipError> {
        self.update(name, |entry| entry.acl.set(pattern, enabled))
    }

    pub fn is_served(&self, name: &str) -> bool {
        self.groups
            .get(name)
            .is_some_and(|entry| entry.handler.is_some())
    }

    /// Names of every group with a handler.
    pub fn served(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(_, entry)| entry.handler.is_some())
            .map(|(name, _)| name)
            .collect()
    }

    /// Whether any served group lets `ip` in.
    pub fn admits(&self, ip: IpAddr) -> bool {
        self.groups
            .iter()
            .any(|(_, entry)| entry.handler.is_some() && entry.acl.allows(ip))
    }

    /// Handler for wire group id `id`, if served and open to `ip`.
    pub fn route(&self, id: u64, ip: IpAddr) -> Option<(&str, Arc<dyn GroupHandler>)> {
        let (name, entry) = self.groups.get_by_key(id)?;
        let handler = entry.handler.as_ref()?;
        entry.acl.allows(ip).then(|| (name, Arc::clone(handler)))
    }
}

/// [`Handler`] installed in the engine of every KFC node.
#[derive(Clone)]
pub struct KfcServer {
    groups: Arc<RwLock<GroupTable>>,
}

impl KfcServer {
    pub fn new(groups: Arc<RwLock<GroupTable>>) -> Self {
        Self { groups }
    }
}

impl Handler<KfcPacket> for KfcServer {
    fn on_connect(&self, peer: SocketAddr, _local: SocketAddr) -> bool {
        let admitted = self.groups.read().admits(peer.ip());
        if !admitted {
            debug!(%peer, "No served group admits peer");
        }
        admitted
    }

    fn process(&self, request: &mut Request<KfcPacket>) {
        let peer = request.peer();
        let Some(packet) = request.input() else {
            return;
        };
        if packet.kind != PacketKind::Request {
            debug!(%peer, channel = packet.channel, "Ignoring non-request packet");
            return;
        }
        let route = self
            .groups
            .read()
            .route(packet.group, peer.ip())
            .map(|(name, handler)| (name.to_owned(), handler));
        let Some((group, handler)) = route else {
            debug!(%peer, group = packet.group, "No route for request");
            return;
        };
        trace!(%peer, %group, channel = packet.channel, "Dispatching request");
        let reply = handler
            .process(packet, peer)
            .map(|payload| packet.respond(payload));
        if let Some(reply) = reply {
            request.reply(reply);
        }
    }
}

impl std::fmt::Debug for KfcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KfcServer")
            .field("served", &self.groups.read().served())
            .finish()
    }
}
