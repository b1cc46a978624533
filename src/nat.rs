//! Reachability orchestration.
//!
//! [`PeerNat`] is the entry point the node's bootstrap logic calls once it
//! is listening. `become_reachable` runs the pipeline:
//!
//! 1. **Discover**: ask reachable peers how they see us. Reachable means done.
//! 2. **Port forwarding**: behind a NAT, map a pair of external ports through
//!    UPnP or NAT-PMP and advertise the external address.
//! 3. **Verify**: discover again through the forwarded ports.
//! 4. **Relay fallback**: if any of the above failed, advertise the address
//!    as firewalled, bootstrap, set up the relay quorum, announce the relayed
//!    address and start pushing routing snapshots to the relays.
//!
//! The pipeline runs once; every caller, concurrent or later, receives the
//! same outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NatConfig};
use crate::error::{NatError, RconError, RelayError, Stage};
use crate::identity::PeerAddress;
use crate::portmap::{ExternalPorts, PortForwardingManager};
use crate::protocols::{
    Bootstrap, DiscoverOutcome, Discovery, PortMapper, RconRpc, RelayRpc, RoutingTableView,
};
use crate::rcon::RconNegotiator;
use crate::relay::{RelayPool, RelayPoolSnapshot};

/// How the node ended up reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// Inbound connections reach the node without help.
    Direct(PeerAddress),
    /// Reachable through ports mapped on the gateway.
    PortForwarded {
        address: PeerAddress,
        ports: ExternalPorts,
    },
    /// Only reachable through relays; `address` is marked firewalled.
    Relayed {
        address: PeerAddress,
        relays: Vec<PeerAddress>,
    },
}

impl Reachability {
    pub fn address(&self) -> &PeerAddress {
        match self {
            Reachability::Direct(address) => address,
            Reachability::PortForwarded { address, .. } => address,
            Reachability::Relayed { address, .. } => address,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, Reachability::Relayed { .. })
    }
}

/// Collaborators the orchestrator drives.
pub struct NatServices<R, C> {
    pub discovery: Arc<dyn Discovery>,
    pub bootstrap: Arc<dyn Bootstrap>,
    pub routing: Arc<dyn RoutingTableView>,
    /// Tried in order: UPnP first, then NAT-PMP.
    pub port_mappers: Vec<Arc<dyn PortMapper>>,
    pub relay_rpc: Arc<R>,
    pub rcon_rpc: Arc<C>,
}

pub struct PeerNat<R: RelayRpc, C: RconRpc> {
    config: NatConfig,
    discovery: Arc<dyn Discovery>,
    bootstrap: Arc<dyn Bootstrap>,
    routing: Arc<dyn RoutingTableView>,
    port_forwarding: PortForwardingManager,
    relays: RelayPool<R>,
    rcon: RconNegotiator<C>,
    advertised: watch::Sender<PeerAddress>,
    outcome: OnceCell<Result<Reachability, NatError>>,
    shut_down: AtomicBool,
}

impl<R: RelayRpc, C: RconRpc> PeerNat<R, C> {
    /// Must be called inside a tokio runtime; spawns the relay pool actor.
    pub fn new(
        local: PeerAddress,
        config: NatConfig,
        services: NatServices<R, C>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (advertised, advertised_rx) = watch::channel(local);
        let rcon = RconNegotiator::new(services.rcon_rpc, advertised_rx, config.rcon_default_timeout);
        let relays = RelayPool::new(services.relay_rpc, &config);

        Ok(Self {
            discovery: services.discovery,
            bootstrap: services.bootstrap,
            routing: services.routing,
            port_forwarding: PortForwardingManager::new(services.port_mappers),
            relays,
            rcon,
            advertised,
            outcome: OnceCell::new(),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Makes the node reachable, directly or through relays.
    ///
    /// Only the first call does any work; later and concurrent callers get a
    /// copy of its outcome. An `Err` is terminal and carries the stage that
    /// failed last.
    pub async fn become_reachable(&self) -> Result<Reachability, NatError> {
        if self.is_shut_down() {
            return Err(NatError::ShutDown);
        }
        self.outcome.get_or_init(|| self.reach()).await.clone()
    }

    async fn reach(&self) -> Result<Reachability, NatError> {
        match self.reach_directly().await {
            Ok(reachability) => return Ok(reachability),
            Err(NatError::ShutDown) => return Err(NatError::ShutDown),
            Err(e) => {
                info!(stage = ?e.stage(), error = %e, "not directly reachable, falling back to relays");
            }
        }
        self.reach_via_relays().await
    }

    async fn reach_directly(&self) -> Result<Reachability, NatError> {
        let current = self.advertised_address();
        let outcome = self
            .discovery
            .discover(&current)
            .await
            .map_err(|e| NatError::exhausted(Stage::Discover, e))?;

        let (internal, external) = match outcome {
            DiscoverOutcome::Reachable(address) => {
                info!(address = %address, "directly reachable");
                self.advertise(address.clone());
                return Ok(Reachability::Direct(address));
            }
            DiscoverOutcome::BehindNat { internal, external } => (internal, external),
        };
        debug!(internal = %internal, external = %external, "behind NAT");

        if !self.config.port_forwarding {
            return Err(NatError::exhausted(Stage::PortForwarding, "disabled"));
        }
        self.ensure_running()?;
        let ports = self
            .port_forwarding
            .attempt(internal.ip, internal.tcp_port, internal.udp_port)
            .await
            .ok_or_else(|| {
                NatError::exhausted(Stage::PortForwarding, "no port mapping protocol succeeded")
            })?;

        let forwarded = internal.with_ip(external).with_ports(ports.tcp, ports.udp);
        self.advertise(forwarded.clone());
        self.ensure_running()?;

        let failure = match self.discovery.discover(&forwarded).await {
            Ok(DiscoverOutcome::Reachable(address)) => {
                info!(address = %address, "reachable through forwarded ports");
                self.advertise(address.clone());
                return Ok(Reachability::PortForwarded { address, ports });
            }
            Ok(DiscoverOutcome::BehindNat { .. }) => {
                NatError::exhausted(Stage::Verify, "still unreachable through forwarded ports")
            }
            Err(e) => NatError::exhausted(Stage::Verify, e),
        };
        self.port_forwarding.release().await;
        self.advertise(internal);
        Err(failure)
    }

    /// Neither bootstrap round is fatal on its own. A failed first round only
    /// ends the attempt when it leaves no relay candidates, and a failed
    /// second round, which announces the relayed address, is logged and
    /// skipped since the relays already carry our traffic.
    async fn reach_via_relays(&self) -> Result<Reachability, NatError> {
        let address = self.advertised_address().firewalled();
        self.advertise(address.clone());

        let bootstrap_error = match self.bootstrap.bootstrap(&address).await {
            Ok(peers) => {
                debug!(peers, "bootstrapped before relay setup");
                None
            }
            Err(e) => {
                warn!(error = %e, "bootstrap before relay setup failed");
                Some(e.to_string())
            }
        };
        self.ensure_running()?;

        let candidates: Vec<PeerAddress> = if self.config.manual_relays.is_empty() {
            self.routing.relay_candidates()
        } else {
            self.config.manual_relays.clone()
        }
        .into_iter()
        .filter(|peer| peer.identity != address.identity)
        .collect();

        let snapshot = match self
            .relays
            .setup_relays(candidates, self.config.min_relays, self.config.max_fail)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(RelayError::ShutDown) => return Err(NatError::ShutDown),
            Err(RelayError::NoCandidates) if bootstrap_error.is_some() => {
                let reason = bootstrap_error.unwrap_or_default();
                return Err(NatError::exhausted(Stage::Bootstrap, reason));
            }
            Err(e) => return Err(NatError::exhausted(Stage::RelaySetup, e)),
        };

        match self.bootstrap.bootstrap(&address).await {
            Ok(peers) => debug!(peers, "announced relayed address"),
            Err(e) => warn!(error = %e, "announcing relayed address failed"),
        }
        self.ensure_running()?;

        self.relays
            .start_maintenance(self.routing.clone())
            .await
            .map_err(|e| match e {
                RelayError::ShutDown => NatError::ShutDown,
                e => NatError::exhausted(Stage::Maintenance, e),
            })?;

        info!(
            address = %address,
            relays = snapshot.active.len(),
            "reachable through relays"
        );
        Ok(Reachability::Relayed {
            address,
            relays: snapshot.active,
        })
    }

    /// Opens a direct connection to a firewalled peer through one of its
    /// relays. See [`RconNegotiator::start_setup`].
    pub async fn connect_via_relay(
        &self,
        relay: &PeerAddress,
        unreachable: &PeerAddress,
        timeout_secs: i32,
    ) -> Result<C::Connection, RconError> {
        if self.is_shut_down() {
            return Err(RconError::Cancelled);
        }
        self.rcon.start_setup(relay, unreachable, timeout_secs).await
    }

    /// The negotiator the transport hands inbound rcon messages to.
    pub fn rcon(&self) -> &RconNegotiator<C> {
        &self.rcon
    }

    pub fn relay_pool(&self) -> &RelayPool<R> {
        &self.relays
    }

    pub fn relay_snapshot(&self) -> RelayPoolSnapshot {
        self.relays.snapshot()
    }

    pub fn advertised_address(&self) -> PeerAddress {
        self.advertised.borrow().clone()
    }

    /// Receiver notified whenever the advertised address changes.
    pub fn subscribe_address(&self) -> watch::Receiver<PeerAddress> {
        self.advertised.subscribe()
    }

    /// Cancels pending rcon sessions, closes the relay pool and removes any
    /// port mappings. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rcon.cancel_all();
        self.relays.shutdown().await;
        self.port_forwarding.release().await;
        info!("reachability layer shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), NatError> {
        if self.is_shut_down() {
            Err(NatError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn advertise(&self, address: PeerAddress) {
        self.advertised.send_if_modified(|current| {
            if *current == address {
                false
            } else {
                *current = address;
                true
            }
        });
    }
}

impl<R: RelayRpc, C: RconRpc> std::fmt::Debug for PeerNat<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNat")
            .field("advertised", &*self.advertised.borrow())
            .field("outcome", &self.outcome.get())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
