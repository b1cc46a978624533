//! Collaborator traits consumed by the reachability layer.
//!
//! The routing table, the RPC transport, bootstrap and the port-mapping
//! device libraries all live outside this crate. Each is reached through one
//! of the traits below so the relay pool, the rcon negotiator and the
//! orchestrator can be driven by the real node or by in-memory mocks.
//!
//! | Concern | Trait | Used by |
//! |---------|-------|---------|
//! | Relay sessions | [`RelayRpc`] | `relay::RelayPool` |
//! | Reverse connections | [`RconRpc`], [`RelayedPeers`] | `rcon::RconNegotiator` |
//! | Routing snapshot | [`RoutingTableView`] | relay maintenance, relay candidates |
//! | Reachability probe | [`Discovery`] | `nat::PeerNat` |
//! | Neighbour discovery | [`Bootstrap`] | `nat::PeerNat` |
//! | Port mapping | [`PortMapper`] | `portmap::PortForwardingManager` |
//!
//! Like the node's other RPC seams these return `anyhow::Result`; the
//! components translate failures into their own error types.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::identity::{Identity, PeerAddress};
use crate::messages::{RconMessage, RconReply};
use crate::portmap::PortMapping;

/// An established relay session.
#[derive(Debug)]
pub struct RelayLink {
    pub relay: PeerAddress,
    /// Fires, or is dropped, when the relay connection goes away.
    pub closed: oneshot::Receiver<()>,
}

impl RelayLink {
    pub fn new(relay: PeerAddress, closed: oneshot::Receiver<()>) -> Self {
        Self { relay, closed }
    }
}

/// Relay session operations, as seen from the unreachable peer.
#[async_trait]
pub trait RelayRpc: Send + Sync + 'static {
    /// Ask `relay` to relay for us and keep the connection open.
    async fn open_relay(&self, relay: &PeerAddress) -> Result<RelayLink>;

    /// Push the routing snapshot the relay answers lookups from.
    async fn push_routing_table(&self, relay: &PeerAddress, peers: Vec<PeerAddress>) -> Result<()>;

    async fn close_relay(&self, relay: &PeerAddress) -> Result<()>;
}

/// Connection handling for the rcon handshake.
#[async_trait]
pub trait RconRpc: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Open a connection to `peer`, or reuse an existing one.
    async fn connect(&self, peer: &PeerAddress, keep_alive: bool) -> Result<Self::Connection>;

    /// Send `message` over `conn` and wait for the peer's reply.
    async fn send(&self, conn: &Self::Connection, message: RconMessage) -> Result<RconReply>;
}

/// Standing connections held by a relay to the peers it relays for.
pub trait RelayedPeers: Send + Sync {
    type Connection;

    fn standing_connection(&self, peer: &Identity) -> Option<Self::Connection>;
}

pub trait RoutingTableView: Send + Sync + 'static {
    fn snapshot(&self) -> Vec<PeerAddress>;

    /// Peers that could relay for us. Firewalled peers cannot.
    fn relay_candidates(&self) -> Vec<PeerAddress> {
        self.snapshot()
            .into_iter()
            .filter(|peer| !peer.is_firewalled())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// Other peers reach us at this address.
    Reachable(PeerAddress),
    /// Other peers see `external` as our address, so we sit behind a NAT.
    BehindNat { internal: PeerAddress, external: IpAddr },
}

/// Asks already-reachable peers how they see us.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn discover(&self, advertised: &PeerAddress) -> Result<DiscoverOutcome>;
}

#[async_trait]
pub trait Bootstrap: Send + Sync + 'static {
    /// Announce `advertised` to the overlay. Returns the number of peers
    /// that answered.
    async fn bootstrap(&self, advertised: &PeerAddress) -> Result<usize>;
}

/// One automatic port-mapping protocol (UPnP, NAT-PMP).
#[async_trait]
pub trait PortMapper: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `Ok(false)` when no capable device answered.
    async fn map(&self, mapping: &PortMapping) -> Result<bool>;

    async fn unmap(&self, mapping: &PortMapping) -> Result<()>;
}
