//! # Reverse Connections (rcon)
//!
//! A peer behind a NAT accepts no inbound connections, but it keeps a
//! standing connection to each of its relays. To reach it directly a
//! requester asks one of those relays to tell the peer to dial back:
//!
//! ```text
//! requester                  relay                    unreachable
//!     | -- Setup(id) --------> |                           |
//!     |                        | -- Connect(id) ---------> |
//!     | <---------------- new connection + Accept(id) ---- |
//! ```
//!
//! The requester registers a pending session under the setup's message id
//! before sending it. The transport hands every inbound `Accept` to
//! [`RconNegotiator::accept_inbound`], which resolves the session with that
//! id. Each session resolves exactly once: with the connection, with a
//! timeout, or with a failure. Whichever comes first removes the entry, so
//! a connection arriving after the timeout is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::RconError;
use crate::identity::PeerAddress;
use crate::messages::{MessageId, RconMessage, RconReply};
use crate::protocols::{RconRpc, RelayedPeers};

pub fn generate_message_id() -> Result<MessageId, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(MessageId::from_be_bytes(bytes))
}

/// One in-flight handshake, keyed by message id.
struct PendingSession<C> {
    relay: PeerAddress,
    unreachable: PeerAddress,
    timeout_secs: i32,
    reply: oneshot::Sender<C>,
}

type Sessions<C> = Mutex<HashMap<MessageId, PendingSession<C>>>;

fn lock<C>(sessions: &Sessions<C>) -> MutexGuard<'_, HashMap<MessageId, PendingSession<C>>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry however `start_setup` ends, including when the
/// caller drops its future.
struct PendingGuard<'a, C> {
    sessions: &'a Sessions<C>,
    message_id: MessageId,
}

impl<C> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        lock(self.sessions).remove(&self.message_id);
    }
}

pub struct RconNegotiator<N: RconRpc> {
    network: Arc<N>,
    local: watch::Receiver<PeerAddress>,
    default_timeout: Duration,
    pending: Sessions<N::Connection>,
}

impl<N: RconRpc> RconNegotiator<N> {
    /// `local` tracks the address we advertise; it is sent as the setup's
    /// sender so the unreachable peer knows where to dial.
    pub fn new(
        network: Arc<N>,
        local: watch::Receiver<PeerAddress>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            network,
            local,
            default_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a direct connection to `unreachable` through `relay`.
    ///
    /// `timeout_secs` is both the deadline for the whole handshake, relay
    /// round trip included, and how long the peer keeps the new connection
    /// open; `-1` keeps it open for good and waits for the default handshake
    /// timeout.
    pub async fn start_setup(
        &self,
        relay: &PeerAddress,
        unreachable: &PeerAddress,
        timeout_secs: i32,
    ) -> Result<N::Connection, RconError> {
        let conn = self
            .network
            .connect(relay, false)
            .await
            .map_err(|e| RconError::NoChannel(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let message_id = self.register(relay, unreachable, timeout_secs, reply_tx)?;
        let _guard = PendingGuard {
            sessions: &self.pending,
            message_id,
        };

        let setup = RconMessage::Setup {
            message_id,
            sender: self.local.borrow().clone(),
            recipient: relay.with_identity(unreachable.identity),
            timeout_secs,
        };
        debug!(
            relay = %relay.identity.short(),
            target = %unreachable.identity.short(),
            message_id,
            "sending rcon setup"
        );
        let wait = self.wait_for(timeout_secs);
        let deadline = Instant::now() + wait;
        let mut reply_rx = reply_rx;
        match tokio::time::timeout_at(deadline, self.network.send(&conn, setup)).await {
            Ok(Ok(RconReply::Ack)) => {}
            Ok(Ok(RconReply::Rejected { reason })) => return Err(RconError::Rejected(reason)),
            Ok(Err(e)) => return Err(RconError::SendFailed(e.to_string())),
            Err(_) => return Self::expired(&mut reply_rx, unreachable, message_id, wait),
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(conn)) => {
                info!(target = %unreachable.identity.short(), message_id, "reverse connection established");
                Ok(conn)
            }
            Ok(Err(_)) => Err(RconError::Cancelled),
            Err(_) => Self::expired(&mut reply_rx, unreachable, message_id, wait),
        }
    }

    fn expired(
        reply_rx: &mut oneshot::Receiver<N::Connection>,
        unreachable: &PeerAddress,
        message_id: MessageId,
        wait: Duration,
    ) -> Result<N::Connection, RconError> {
        // A connection may have been matched in the same instant.
        if let Ok(conn) = reply_rx.try_recv() {
            return Ok(conn);
        }
        warn!(
            target = %unreachable.identity.short(),
            message_id,
            secs = wait.as_secs(),
            "no reverse connection could be established"
        );
        Err(RconError::Timeout(wait.as_secs()))
    }

    fn register(
        &self,
        relay: &PeerAddress,
        unreachable: &PeerAddress,
        timeout_secs: i32,
        reply: oneshot::Sender<N::Connection>,
    ) -> Result<MessageId, RconError> {
        let mut sessions = lock(&self.pending);
        let message_id = loop {
            let id = generate_message_id()
                .map_err(|e| RconError::SendFailed(format!("CSPRNG unavailable: {e}")))?;
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        sessions.insert(
            message_id,
            PendingSession {
                relay: relay.clone(),
                unreachable: unreachable.clone(),
                timeout_secs,
                reply,
            },
        );
        Ok(message_id)
    }

    fn wait_for(&self, timeout_secs: i32) -> Duration {
        if timeout_secs < 0 {
            self.default_timeout
        } else {
            Duration::from_secs(timeout_secs as u64)
        }
    }

    /// Hands an inbound connection that carried `Accept { message_id }` to
    /// its pending session. Returns false when no session waits for it; the
    /// connection is then dropped.
    pub fn accept_inbound(&self, message_id: MessageId, conn: N::Connection) -> bool {
        let session = lock(&self.pending).remove(&message_id);
        match session {
            Some(session) => {
                trace!(
                    relay = %session.relay.identity.short(),
                    target = %session.unreachable.identity.short(),
                    timeout_secs = session.timeout_secs,
                    message_id,
                    "matched reverse connection"
                );
                session.reply.send(conn).is_ok()
            }
            None => {
                debug!(message_id, "dropping unmatched reverse connection");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Resolves every pending session with [`RconError::Cancelled`].
    pub fn cancel_all(&self) {
        let cancelled = std::mem::take(&mut *lock(&self.pending));
        if !cancelled.is_empty() {
            debug!(sessions = cancelled.len(), "cancelling pending rcon sessions");
        }
    }

    /// Relay side: forwards a setup to the peer it names over that peer's
    /// standing connection.
    pub async fn handle_setup<R>(&self, relayed: &R, message: RconMessage) -> RconReply
    where
        R: RelayedPeers<Connection = N::Connection>,
    {
        let RconMessage::Setup {
            message_id,
            sender,
            recipient,
            timeout_secs,
        } = message
        else {
            return RconReply::Rejected {
                reason: format!("expected setup, got {}", message.kind()),
            };
        };

        let Some(conn) = relayed.standing_connection(&recipient.identity) else {
            debug!(target = %recipient.identity.short(), "rcon setup for a peer we do not relay");
            return RconReply::Rejected {
                reason: "peer is not relayed here".into(),
            };
        };

        let connect = RconMessage::Connect {
            message_id,
            requester: sender,
            timeout_secs,
            keep_alive: true,
        };
        let wait = self.wait_for(timeout_secs);
        match tokio::time::timeout(wait, self.network.send(&conn, connect)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => RconReply::Rejected {
                reason: e.to_string(),
            },
            Err(_) => {
                debug!(target = %recipient.identity.short(), message_id, "relayed peer did not answer connect");
                RconReply::Rejected {
                    reason: format!("relayed peer did not answer within {}s", wait.as_secs()),
                }
            }
        }
    }

    /// Unreachable side: dials the requester named in a connect message and
    /// announces the new connection with `Accept`.
    pub async fn handle_connect(&self, message: RconMessage) -> RconReply {
        let RconMessage::Connect {
            message_id,
            requester,
            timeout_secs,
            keep_alive,
        } = message
        else {
            return RconReply::Rejected {
                reason: format!("expected connect, got {}", message.kind()),
            };
        };

        let wait = self.wait_for(timeout_secs);
        let dial = async {
            let conn = self.network.connect(&requester, keep_alive).await?;
            self.network
                .send(&conn, RconMessage::Accept { message_id })
                .await
        };
        match tokio::time::timeout(wait, dial).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(requester = %requester.identity.short(), error = %e, "reverse dial failed");
                RconReply::Rejected {
                    reason: e.to_string(),
                }
            }
            Err(_) => RconReply::Rejected {
                reason: format!("requester not reached within {}s", wait.as_secs()),
            },
        }
    }
}

impl<N: RconRpc> std::fmt::Debug for RconNegotiator<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconNegotiator")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
