//! Relay pool with actor-based architecture.
//!
//! An unreachable peer keeps standing connections to a quorum of publicly
//! reachable peers (its relays). The relays forward traffic for it and answer
//! routing queries on its behalf from routing snapshots it pushes to them.
//!
//! # Architecture
//!
//! - `RelayPool`: the public handle. Sends commands to the actor and reads
//!   state from a `watch` snapshot.
//! - `RelayPoolActor`: owns the active links, the candidate queue and the
//!   failed-relay backoff table, and processes commands sequentially.
//! - Establish tasks: open relay links concurrently and report the outcome
//!   back to the actor, so the actor never blocks on the network.
//! - Link watchers: one task per active link, reporting when it closes.
//! - Maintenance: a fixed-interval task pushing the routing snapshot to every
//!   active relay, stopped through its `MaintenanceHandle`.
//!
//! # Quorum
//!
//! `setup_relays` succeeds once `min_relays` links are up. Attempts run
//! concurrently; a new candidate is only tried after an attempt failed, and
//! setup gives up once more than `max_fail` attempts failed or the
//! candidates ran out. Links that come up after the outcome was decided are
//! closed again.
//!
//! # Replacement
//!
//! When an active link drops, the relay goes into backoff and exactly one
//! replacement is established from the remaining candidates. Replacement
//! runs in the background; its failures are logged and counted but never
//! reach the caller of the original setup.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::NatConfig;
use crate::error::RelayError;
use crate::identity::{Identity, PeerAddress};
use crate::protocols::{RelayLink, RelayRpc, RoutingTableView};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    Uninitialized,
    SettingUp,
    QuorumMet,
    SetupFailed,
    Maintaining,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    Candidate,
    Connecting,
    Active,
    /// Dropped or refused; skipped until its backoff expires.
    Failed,
    Closed,
}

/// Read-only view of the pool, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPoolSnapshot {
    pub state: PoolState,
    pub active: Vec<PeerAddress>,
    pub connecting: Vec<PeerAddress>,
    pub candidates: Vec<PeerAddress>,
    pub backed_off: Vec<Identity>,
    /// Consecutive setups that missed the quorum.
    pub setup_failures: u32,
    pub replacements_started: u64,
    pub replacements_succeeded: u64,
    pub replacements_failed: u64,
}

impl RelayPoolSnapshot {
    fn new() -> Self {
        Self {
            state: PoolState::Uninitialized,
            active: Vec::new(),
            connecting: Vec::new(),
            candidates: Vec::new(),
            backed_off: Vec::new(),
            setup_failures: 0,
            replacements_started: 0,
            replacements_succeeded: 0,
            replacements_failed: 0,
        }
    }

    pub fn relay_state(&self, peer: &Identity) -> RelayState {
        let has = |list: &[PeerAddress]| list.iter().any(|p| p.identity == *peer);
        if has(&self.active) {
            RelayState::Active
        } else if has(&self.connecting) {
            RelayState::Connecting
        } else if self.backed_off.contains(peer) {
            RelayState::Failed
        } else if has(&self.candidates) {
            RelayState::Candidate
        } else {
            RelayState::Closed
        }
    }

    pub fn is_quorum_met(&self, min_relays: usize) -> bool {
        self.active.len() >= min_relays
    }
}

type SetupReply = oneshot::Sender<Result<RelayPoolSnapshot, RelayError>>;

enum Purpose {
    Setup(SetupReply),
    Replacement,
}

/// Outcome of one batch of relay attempts.
struct Attempts {
    links: Vec<RelayLink>,
    failed: Vec<PeerAddress>,
    unused: Vec<PeerAddress>,
    /// Still in flight when the outcome was decided; closed on arrival.
    abandoned: Vec<PeerAddress>,
}

enum PoolCommand {
    Setup {
        candidates: Vec<PeerAddress>,
        min_relays: usize,
        max_fail: usize,
        reply: SetupReply,
    },
    AttemptsDone {
        attempts: Attempts,
        needed: usize,
        purpose: Purpose,
    },
    LinkClosed {
        relay: Identity,
        link_id: u64,
    },
    MaintenanceStarted,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// MaintenanceHandle
// ============================================================================

struct MaintenanceInner {
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the routing-table push task. Cheap to clone.
#[derive(Clone)]
pub struct MaintenanceHandle {
    inner: Arc<MaintenanceInner>,
}

impl MaintenanceHandle {
    /// Stops the task. Returns once the task has finished; no push starts
    /// after this returns. Calling it again, from any task, is a no-op that
    /// also waits for the stop.
    pub async fn cancel(&self) {
        let _ = self.inner.stop_tx.send(true);
        let mut task = self.inner.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "relay maintenance task ended abnormally");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }
}

impl std::fmt::Debug for MaintenanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// RelayPool handle
// ============================================================================

pub struct RelayPool<N: RelayRpc> {
    cmd_tx: mpsc::Sender<PoolCommand>,
    snapshot_rx: watch::Receiver<RelayPoolSnapshot>,
    network: Arc<N>,
    update_interval: Duration,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl<N: RelayRpc> std::fmt::Debug for RelayPool<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot_rx.borrow();
        f.debug_struct("RelayPool")
            .field("state", &snapshot.state)
            .field("active", &snapshot.active.len())
            .finish()
    }
}

impl<N: RelayRpc> RelayPool<N> {
    /// Spawns the pool actor. Must be called inside a tokio runtime.
    pub fn new(network: Arc<N>, config: &NatConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(RelayPoolSnapshot::new());

        let actor = RelayPoolActor::new(network.clone(), config, cmd_tx.downgrade(), snapshot_tx);
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            snapshot_rx,
            network,
            update_interval: config.peer_map_update_interval,
            maintenance: Mutex::new(None),
        }
    }

    /// Establishes relay links until `min_relays` are active.
    pub async fn setup_relays(
        &self,
        candidates: Vec<PeerAddress>,
        min_relays: usize,
        max_fail: usize,
    ) -> Result<RelayPoolSnapshot, RelayError> {
        if min_relays == 0 {
            return Err(RelayError::InvalidConfig("min_relays must be at least 1".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Setup {
                candidates,
                min_relays,
                max_fail,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RelayError::ShutDown)?;
        reply_rx.await.map_err(|_| RelayError::ShutDown)?
    }

    /// Starts pushing `routing` snapshots to the active relays, first push
    /// immediately. A running maintenance task is reused.
    pub async fn start_maintenance(
        &self,
        routing: Arc<dyn RoutingTableView>,
    ) -> Result<MaintenanceHandle, RelayError> {
        let mut slot = self.maintenance.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_cancelled() {
                return Ok(handle.clone());
            }
        }
        if self.snapshot_rx.borrow().state == PoolState::ShutDown {
            return Err(RelayError::ShutDown);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_maintenance(
            self.network.clone(),
            routing,
            self.snapshot_rx.clone(),
            stop_rx,
            self.update_interval,
        ));
        let handle = MaintenanceHandle {
            inner: Arc::new(MaintenanceInner {
                stop_tx,
                task: Mutex::new(Some(task)),
            }),
        };
        *slot = Some(handle.clone());
        let _ = self.cmd_tx.send(PoolCommand::MaintenanceStarted).await;
        Ok(handle)
    }

    /// Cancels maintenance and closes every active link. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.cancel().await;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub fn snapshot(&self) -> RelayPoolSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified after every state change.
    pub fn subscribe(&self) -> watch::Receiver<RelayPoolSnapshot> {
        self.snapshot_rx.clone()
    }
}

// ============================================================================
// Establishing links
// ============================================================================

type AttemptFuture = BoxFuture<'static, (PeerAddress, anyhow::Result<RelayLink>)>;

fn attempt<N: RelayRpc>(network: Arc<N>, relay: PeerAddress, timeout: Duration) -> AttemptFuture {
    async move {
        trace!(relay = %relay.identity.short(), "opening relay link");
        let result = match tokio::time::timeout(timeout, network.open_relay(&relay)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("relay did not answer within {:?}", timeout)),
        };
        (relay, result)
    }
    .boxed()
}

async fn establish<N: RelayRpc>(
    network: Arc<N>,
    candidates: Vec<PeerAddress>,
    needed: usize,
    max_fail: usize,
    timeout: Duration,
) -> Attempts {
    let mut queue: VecDeque<PeerAddress> = candidates.into();
    let mut in_flight: FuturesUnordered<AttemptFuture> = FuturesUnordered::new();
    let mut in_flight_peers: Vec<PeerAddress> = Vec::new();
    let mut links = Vec::new();
    let mut failed = Vec::new();

    for _ in 0..needed {
        match queue.pop_front() {
            Some(relay) => {
                in_flight_peers.push(relay.clone());
                in_flight.push(attempt(network.clone(), relay, timeout));
            }
            None => break,
        }
    }

    while links.len() < needed && failed.len() <= max_fail {
        let Some((relay, result)) = in_flight.next().await else {
            break;
        };
        in_flight_peers.retain(|p| p.identity != relay.identity);
        match result {
            Ok(link) => {
                debug!(relay = %relay.identity.short(), "relay link established");
                links.push(link);
            }
            Err(e) => {
                debug!(relay = %relay.identity.short(), error = %e, "relay link failed");
                failed.push(relay);
                if failed.len() <= max_fail {
                    if let Some(next) = queue.pop_front() {
                        in_flight_peers.push(next.clone());
                        in_flight.push(attempt(network.clone(), next, timeout));
                    }
                }
            }
        }
    }

    if !in_flight.is_empty() {
        tokio::spawn(discard_late_links(network, in_flight));
    }

    Attempts {
        links,
        failed,
        unused: queue.into(),
        abandoned: in_flight_peers,
    }
}

async fn discard_late_links<N: RelayRpc>(
    network: Arc<N>,
    mut in_flight: FuturesUnordered<AttemptFuture>,
) {
    while let Some((relay, result)) = in_flight.next().await {
        if result.is_ok() {
            debug!(relay = %relay.identity.short(), "closing relay link that arrived late");
            if let Err(e) = network.close_relay(&relay).await {
                trace!(relay = %relay.identity.short(), error = %e, "close of late relay failed");
            }
        }
    }
}

async fn close_links<N: RelayRpc>(network: &N, relays: impl IntoIterator<Item = PeerAddress>) {
    let closes = relays.into_iter().map(|relay| async move {
        if let Err(e) = network.close_relay(&relay).await {
            debug!(relay = %relay.identity.short(), error = %e, "failed to close relay link");
        }
    });
    join_all(closes).await;
}

// ============================================================================
// Maintenance
// ============================================================================

async fn run_maintenance<N: RelayRpc>(
    network: Arc<N>,
    routing: Arc<dyn RoutingTableView>,
    snapshot_rx: watch::Receiver<RelayPoolSnapshot>,
    mut stop_rx: watch::Receiver<bool>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = interval.tick() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let relays = snapshot_rx.borrow().active.clone();
        if relays.is_empty() {
            continue;
        }
        let peers = routing.snapshot();
        trace!(relays = relays.len(), peers = peers.len(), "pushing routing table to relays");

        let pushes = relays.iter().map(|relay| {
            let network = network.clone();
            let peers = peers.clone();
            async move {
                if let Err(e) = network.push_routing_table(relay, peers).await {
                    debug!(relay = %relay.identity.short(), error = %e, "routing push failed");
                }
            }
        });
        join_all(pushes).await;
    }
    debug!("relay maintenance stopped");
}

// ============================================================================
// RelayPool actor
// ============================================================================

struct ActiveRelay {
    address: PeerAddress,
    link_id: u64,
}

struct RelayPoolActor<N: RelayRpc> {
    network: Arc<N>,
    cmd_tx: mpsc::WeakSender<PoolCommand>,
    snapshot_tx: watch::Sender<RelayPoolSnapshot>,
    state: PoolState,
    active: HashMap<Identity, ActiveRelay>,
    connecting: HashMap<Identity, PeerAddress>,
    candidates: VecDeque<PeerAddress>,
    backoff: LruCache<Identity, Instant>,
    backoff_duration: Duration,
    connect_timeout: Duration,
    max_fail: usize,
    maintaining: bool,
    next_link_id: u64,
    setup_failures: u32,
    replacements_started: u64,
    replacements_succeeded: u64,
    replacements_failed: u64,
}

impl<N: RelayRpc> RelayPoolActor<N> {
    fn new(
        network: Arc<N>,
        config: &NatConfig,
        cmd_tx: mpsc::WeakSender<PoolCommand>,
        snapshot_tx: watch::Sender<RelayPoolSnapshot>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.failed_relay_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            cmd_tx,
            snapshot_tx,
            state: PoolState::Uninitialized,
            active: HashMap::new(),
            connecting: HashMap::new(),
            candidates: VecDeque::new(),
            backoff: LruCache::new(capacity),
            backoff_duration: config.failed_relay_wait_time,
            connect_timeout: config.relay_connect_timeout,
            max_fail: config.max_fail,
            maintaining: false,
            next_link_id: 0,
            setup_failures: 0,
            replacements_started: 0,
            replacements_succeeded: 0,
            replacements_failed: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PoolCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PoolCommand::Setup {
                    candidates,
                    min_relays,
                    max_fail,
                    reply,
                } => self.start_setup(candidates, min_relays, max_fail, reply),
                PoolCommand::AttemptsDone {
                    attempts,
                    needed,
                    purpose,
                } => self.finish_attempts(attempts, needed, purpose).await,
                PoolCommand::LinkClosed { relay, link_id } => self.link_closed(relay, link_id),
                PoolCommand::MaintenanceStarted => {
                    self.maintaining = true;
                    if self.state == PoolState::QuorumMet {
                        self.state = PoolState::Maintaining;
                    }
                }
                PoolCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    self.publish();
                    let _ = reply.send(());
                    break;
                }
            }
            self.publish();
        }
        debug!("relay pool actor stopped");
    }

    fn start_setup(
        &mut self,
        candidates: Vec<PeerAddress>,
        min_relays: usize,
        max_fail: usize,
        reply: SetupReply,
    ) {
        self.max_fail = max_fail;
        for candidate in candidates {
            self.add_candidate(candidate);
        }

        let needed = min_relays.saturating_sub(self.active.len());
        if needed == 0 {
            self.state = self.quorum_state();
            self.publish();
            let _ = reply.send(Ok(self.build_snapshot()));
            return;
        }

        let batch = self.take_candidates();
        if batch.is_empty() {
            let _ = reply.send(Err(RelayError::NoCandidates));
            return;
        }

        info!(needed, max_fail, candidates = batch.len(), "setting up relays");
        self.state = PoolState::SettingUp;
        self.spawn_attempts(batch, needed, max_fail, Purpose::Setup(reply));
    }

    fn add_candidate(&mut self, candidate: PeerAddress) {
        let id = candidate.identity;
        if self.active.contains_key(&id)
            || self.connecting.contains_key(&id)
            || self.candidates.iter().any(|c| c.identity == id)
        {
            return;
        }
        self.candidates.push_back(candidate);
    }

    /// Drains the candidate queue, leaving out relays still in backoff.
    fn take_candidates(&mut self) -> Vec<PeerAddress> {
        let mut batch = Vec::new();
        let mut kept = VecDeque::new();
        while let Some(candidate) = self.candidates.pop_front() {
            if self.is_backed_off(&candidate.identity) {
                kept.push_back(candidate);
            } else {
                batch.push(candidate);
            }
        }
        self.candidates = kept;
        batch
    }

    fn is_backed_off(&mut self, peer: &Identity) -> bool {
        match self.backoff.get(peer) {
            Some(since) if since.elapsed() < self.backoff_duration => true,
            Some(_) => {
                self.backoff.pop(peer);
                false
            }
            None => false,
        }
    }

    fn spawn_attempts(
        &mut self,
        batch: Vec<PeerAddress>,
        needed: usize,
        max_fail: usize,
        purpose: Purpose,
    ) {
        for relay in &batch {
            self.connecting.insert(relay.identity, relay.clone());
        }
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let network = self.network.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let attempts = establish(network.clone(), batch, needed, max_fail, timeout).await;
            let done = PoolCommand::AttemptsDone {
                attempts,
                needed,
                purpose,
            };
            if let Err(mpsc::error::SendError(cmd)) = cmd_tx.send(done).await {
                // The pool shut down meanwhile.
                if let PoolCommand::AttemptsDone { attempts, .. } = cmd {
                    close_links(&*network, attempts.links.into_iter().map(|l| l.relay)).await;
                }
            }
        });
    }

    /// A met quorum keeps reporting maintenance once it has started.
    fn quorum_state(&self) -> PoolState {
        if self.maintaining {
            PoolState::Maintaining
        } else {
            PoolState::QuorumMet
        }
    }

    async fn finish_attempts(&mut self, attempts: Attempts, needed: usize, purpose: Purpose) {
        let Attempts {
            links,
            failed,
            unused,
            abandoned,
        } = attempts;

        for relay in links
            .iter()
            .map(|l| &l.relay)
            .chain(&failed)
            .chain(&unused)
            .chain(&abandoned)
        {
            self.connecting.remove(&relay.identity);
        }
        let now = Instant::now();
        for relay in &failed {
            self.backoff.put(relay.identity, now);
        }
        for relay in unused {
            self.add_candidate(relay);
        }

        if self.state == PoolState::ShutDown {
            close_links(&*self.network, links.into_iter().map(|l| l.relay)).await;
            if let Purpose::Setup(reply) = purpose {
                let _ = reply.send(Err(RelayError::ShutDown));
            }
            return;
        }

        match purpose {
            Purpose::Setup(reply) => {
                if links.len() >= needed {
                    for link in links {
                        self.add_active(link);
                    }
                    self.state = self.quorum_state();
                    self.setup_failures = 0;
                    info!(active = self.active.len(), "relay quorum met");
                    self.publish();
                    let _ = reply.send(Ok(self.build_snapshot()));
                } else {
                    let established = links.len();
                    close_links(&*self.network, links.into_iter().map(|l| l.relay)).await;
                    self.state = PoolState::SetupFailed;
                    self.setup_failures += 1;
                    warn!(
                        established,
                        failures = failed.len(),
                        "relay setup failed, quorum not met"
                    );
                    self.publish();
                    let _ = reply.send(Err(RelayError::QuorumNotMet {
                        established,
                        failures: failed.len(),
                    }));
                }
            }
            Purpose::Replacement => {
                if links.is_empty() {
                    self.replacements_failed += 1;
                    warn!(
                        failures = failed.len(),
                        active = self.active.len(),
                        "relay replacement failed"
                    );
                } else {
                    for link in links {
                        info!(relay = %link.relay.identity.short(), "relay replaced");
                        self.add_active(link);
                    }
                    self.replacements_succeeded += 1;
                }
            }
        }
    }

    fn add_active(&mut self, link: RelayLink) {
        let RelayLink { relay, closed } = link;
        let id = relay.identity;
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        self.active.insert(
            id,
            ActiveRelay {
                address: relay,
                link_id,
            },
        );

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let _ = closed.await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx
                    .send(PoolCommand::LinkClosed { relay: id, link_id })
                    .await;
            }
        });
    }

    fn link_closed(&mut self, relay: Identity, link_id: u64) {
        if self.state == PoolState::ShutDown {
            return;
        }
        match self.active.get(&relay) {
            Some(entry) if entry.link_id == link_id => {}
            _ => return,
        }
        self.active.remove(&relay);
        self.backoff.put(relay, Instant::now());
        self.replacements_started += 1;
        warn!(
            relay = %relay.short(),
            active = self.active.len(),
            "relay link lost, starting replacement"
        );

        let batch = self.take_candidates();
        if batch.is_empty() {
            self.replacements_failed += 1;
            warn!("no relay candidates left for replacement");
            return;
        }
        let max_fail = self.max_fail;
        self.spawn_attempts(batch, 1, max_fail, Purpose::Replacement);
    }

    async fn shutdown(&mut self) {
        if self.state == PoolState::ShutDown {
            return;
        }
        self.state = PoolState::ShutDown;
        let relays: Vec<PeerAddress> = self.active.drain().map(|(_, a)| a.address).collect();
        info!(relays = relays.len(), "shutting down relay pool");
        close_links(&*self.network, relays).await;
        self.candidates.clear();
    }

    fn build_snapshot(&mut self) -> RelayPoolSnapshot {
        let backoff_duration = self.backoff_duration;
        let backed_off = self
            .backoff
            .iter()
            .filter(|(_, since)| since.elapsed() < backoff_duration)
            .map(|(id, _)| *id)
            .collect();
        let mut active: Vec<PeerAddress> =
            self.active.values().map(|a| a.address.clone()).collect();
        active.sort_by_key(|a| a.identity);
        RelayPoolSnapshot {
            state: self.state,
            active,
            connecting: self.connecting.values().cloned().collect(),
            candidates: self.candidates.iter().cloned().collect(),
            backed_off,
            setup_failures: self.setup_failures,
            replacements_started: self.replacements_started,
            replacements_succeeded: self.replacements_succeeded,
            replacements_failed: self.replacements_failed,
        }
    }

    fn publish(&mut self) {
        let snapshot = self.build_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_address(seed: u8) -> PeerAddress {
        PeerAddress::new(
            Identity::from_bytes([seed; 32]),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)),
            4000,
            4000,
        )
    }

    fn make_candidates(n: u8) -> Vec<PeerAddress> {
        (1..=n).map(make_address).collect()
    }

    struct MockNetwork {
        refusing: HashSet<Identity>,
        opens: Mutex<Vec<Identity>>,
        closes: Mutex<Vec<Identity>>,
        pushes: Mutex<Vec<(Identity, usize)>>,
        links: Mutex<HashMap<Identity, oneshot::Sender<()>>>,
    }

    impl MockNetwork {
        fn new(refusing: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                refusing: refusing.iter().map(|s| Identity::from_bytes([*s; 32])).collect(),
                opens: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
                pushes: Mutex::new(Vec::new()),
                links: Mutex::new(HashMap::new()),
            })
        }

        async fn kill(&self, seed: u8) {
            let id = Identity::from_bytes([seed; 32]);
            if let Some(tx) = self.links.lock().await.remove(&id) {
                let _ = tx.send(());
            }
        }

        async fn opened(&self) -> Vec<Identity> {
            let mut opened = self.opens.lock().await.clone();
            opened.sort();
            opened
        }
    }

    #[async_trait]
    impl RelayRpc for MockNetwork {
        async fn open_relay(&self, relay: &PeerAddress) -> Result<RelayLink> {
            self.opens.lock().await.push(relay.identity);
            if self.refusing.contains(&relay.identity) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                return Err(anyhow!("relay refused"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (tx, rx) = oneshot::channel();
            self.links.lock().await.insert(relay.identity, tx);
            Ok(RelayLink::new(relay.clone(), rx))
        }

        async fn push_routing_table(&self, relay: &PeerAddress, peers: Vec<PeerAddress>) -> Result<()> {
            self.pushes.lock().await.push((relay.identity, peers.len()));
            Ok(())
        }

        async fn close_relay(&self, relay: &PeerAddress) -> Result<()> {
            self.closes.lock().await.push(relay.identity);
            self.links.lock().await.remove(&relay.identity);
            Ok(())
        }
    }

    struct StaticRouting(Vec<PeerAddress>);

    impl RoutingTableView for StaticRouting {
        fn snapshot(&self) -> Vec<PeerAddress> {
            self.0.clone()
        }
    }

    async fn wait_until<F>(pool: &RelayPool<MockNetwork>, mut predicate: F) -> RelayPoolSnapshot
    where
        F: FnMut(&RelayPoolSnapshot) -> bool,
    {
        let mut rx = pool.subscribe();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::timeout(Duration::from_secs(30), rx.changed())
                .await
                .expect("pool state did not change in time")
                .expect("pool actor stopped");
        }
    }

    fn id(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_met_with_first_two_candidates() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());

        let snapshot = pool.setup_relays(make_candidates(5), 2, 2).await.unwrap();

        assert_eq!(snapshot.state, PoolState::QuorumMet);
        let active: Vec<Identity> = snapshot.active.iter().map(|a| a.identity).collect();
        assert_eq!(active, vec![id(1), id(2)]);
        assert_eq!(network.opened().await, vec![id(1), id(2)]);
        assert_eq!(snapshot.candidates.len(), 3);
        assert_eq!(snapshot.relay_state(&id(3)), RelayState::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_fails_once_failures_exceed_tolerance() {
        let network = MockNetwork::new(&[1, 2, 3]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());

        let err = pool.setup_relays(make_candidates(5), 2, 2).await.unwrap_err();
        assert!(matches!(err, RelayError::QuorumNotMet { failures: 3, .. }));

        let opened = network.opened().await;
        assert!(!opened.contains(&id(5)));
        assert_eq!(pool.snapshot().state, PoolState::SetupFailed);
        assert_eq!(pool.snapshot().setup_failures, 1);

        // Candidate 4 was still connecting and gets closed when it arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(network.closes.lock().await.contains(&id(4)));
        assert!(pool.snapshot().active.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_relay_is_replaced_once() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());
        pool.setup_relays(make_candidates(4), 2, 2).await.unwrap();

        network.kill(1).await;
        let snapshot = wait_until(&pool, |s| s.replacements_succeeded == 1).await;

        let active: Vec<Identity> = snapshot.active.iter().map(|a| a.identity).collect();
        assert_eq!(active, vec![id(2), id(3)]);
        assert_eq!(network.opened().await, vec![id(1), id(2), id(3)]);
        assert_eq!(snapshot.replacements_started, 1);
        assert_eq!(snapshot.relay_state(&id(1)), RelayState::Failed);
        assert_eq!(snapshot.relay_state(&id(4)), RelayState::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_failure_is_counted_not_surfaced() {
        let network = MockNetwork::new(&[3]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());
        pool.setup_relays(make_candidates(3), 2, 0).await.unwrap();

        network.kill(2).await;
        let snapshot = wait_until(&pool, |s| s.replacements_failed == 1).await;
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.state, PoolState::QuorumMet);
    }

    #[tokio::test(start_paused = true)]
    async fn backed_off_relays_are_skipped() {
        let network = MockNetwork::new(&[1]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());

        assert!(pool.setup_relays(vec![make_address(1)], 1, 0).await.is_err());
        pool.setup_relays(vec![make_address(1), make_address(2)], 1, 0)
            .await
            .unwrap();

        assert_eq!(network.opened().await, vec![id(1), id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_pushes_until_cancelled() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());
        pool.setup_relays(make_candidates(2), 2, 2).await.unwrap();

        let routing = Arc::new(StaticRouting(make_candidates(7)));
        let handle = pool.start_maintenance(routing).await.unwrap();
        wait_until(&pool, |s| s.state == PoolState::Maintaining).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(network.pushes.lock().await.len(), 2);
        assert!(network.pushes.lock().await.iter().all(|(_, n)| *n == 7));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(network.pushes.lock().await.len(), 4);

        let other = handle.clone();
        handle.cancel().await;
        other.cancel().await;
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(network.pushes.lock().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_setup_keeps_maintenance_state() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());
        pool.setup_relays(make_candidates(2), 2, 2).await.unwrap();
        let _handle = pool
            .start_maintenance(Arc::new(StaticRouting(Vec::new())))
            .await
            .unwrap();
        wait_until(&pool, |s| s.state == PoolState::Maintaining).await;

        let snapshot = pool.setup_relays(make_candidates(2), 2, 2).await.unwrap();
        assert_eq!(snapshot.state, PoolState::Maintaining);
        assert_eq!(pool.snapshot().state, PoolState::Maintaining);
        assert_eq!(network.opened().await, vec![id(1), id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network.clone(), &NatConfig::default());
        pool.setup_relays(make_candidates(2), 2, 2).await.unwrap();
        let handle = pool
            .start_maintenance(Arc::new(StaticRouting(Vec::new())))
            .await
            .unwrap();

        pool.shutdown().await;
        pool.shutdown().await;

        assert!(handle.is_cancelled());
        let mut closed = network.closes.lock().await.clone();
        closed.sort();
        assert_eq!(closed, vec![id(1), id(2)]);
        assert_eq!(pool.snapshot().state, PoolState::ShutDown);
        assert_eq!(
            pool.setup_relays(make_candidates(2), 2, 2).await,
            Err(RelayError::ShutDown)
        );
    }

    #[tokio::test]
    async fn setup_rejects_bad_arguments() {
        let network = MockNetwork::new(&[]);
        let pool = RelayPool::new(network, &NatConfig::default());
        assert_eq!(
            pool.setup_relays(Vec::new(), 2, 2).await,
            Err(RelayError::NoCandidates)
        );
        assert!(matches!(
            pool.setup_relays(make_candidates(2), 0, 2).await,
            Err(RelayError::InvalidConfig(_))
        ));
    }
}
