//! # Wire Protocol Messages
//!
//! Serializable messages exchanged by the reachability layer. They travel
//! inside the node's generic RPC envelope ([`RpcRequest`] / [`RpcResponse`]);
//! only the fields relevant to relaying and reverse connections live here.
//!
//! | Protocol | Request Type | Response Type |
//! |----------|--------------|---------------|
//! | Relay | `RelayRequest` | `RelayResponse` |
//! | Rcon | `RconMessage` | `RconReply` |
//!
//! All deserialization goes through [`deserialize_bounded`], which caps the
//! input size so a hostile peer cannot make us allocate without bound.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Identity, PeerAddress};

/// Identifier echoed by every message of one rcon handshake.
pub type MessageId = u64;

/// Timeout value asking for a reverse connection that is never closed.
pub const KEEP_FOREVER: i32 = -1;

/// Maximum buffer size for deserialization. Routing snapshots are the
/// largest messages.
pub const MAX_DESERIALIZE_SIZE: u64 = 256 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_request(request: &RpcRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(request)
}

pub fn deserialize_request(data: &[u8]) -> Result<RpcRequest, bincode::Error> {
    deserialize_bounded(data)
}

pub fn serialize_response(response: &RpcResponse) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(response)
}

pub fn deserialize_response(data: &[u8]) -> Result<RpcResponse, bincode::Error> {
    deserialize_bounded(data)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RconMessage {
    /// Requester to relay. `recipient` is the relay's address carrying the
    /// unreachable peer's identity.
    Setup {
        message_id: MessageId,
        sender: PeerAddress,
        recipient: PeerAddress,
        timeout_secs: i32,
    },
    /// Relay to unreachable peer: dial `requester` back.
    Connect {
        message_id: MessageId,
        requester: PeerAddress,
        timeout_secs: i32,
        keep_alive: bool,
    },
    /// First message on the reverse connection, matching it to its setup.
    Accept { message_id: MessageId },
}

impl RconMessage {
    pub fn message_id(&self) -> MessageId {
        match self {
            RconMessage::Setup { message_id, .. } => *message_id,
            RconMessage::Connect { message_id, .. } => *message_id,
            RconMessage::Accept { message_id } => *message_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RconMessage::Setup { .. } => "setup",
            RconMessage::Connect { .. } => "connect",
            RconMessage::Accept { .. } => "accept",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RconReply {
    Ack,
    Rejected { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayRequest {
    /// Ask a peer to relay for `from`. The connection carrying this request
    /// stays open as the standing relay connection.
    Setup { from: PeerAddress },
    /// Routing snapshot the relay answers lookups from on our behalf.
    RoutingUpdate {
        from: Identity,
        peers: Vec<PeerAddress>,
    },
    Close { from: Identity },
}

impl RelayRequest {
    pub fn sender_identity(&self) -> Identity {
        match self {
            RelayRequest::Setup { from } => from.identity,
            RelayRequest::RoutingUpdate { from, .. } => *from,
            RelayRequest::Close { from } => *from,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayResponse {
    Accepted,
    Rejected { reason: String },
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Relay(RelayRequest),
    Rcon(RconMessage),
}

impl RpcRequest {
    pub fn sender_identity(&self) -> Option<Identity> {
        match self {
            RpcRequest::Relay(request) => Some(request.sender_identity()),
            RpcRequest::Rcon(RconMessage::Setup { sender, .. }) => Some(sender.identity),
            RpcRequest::Rcon(RconMessage::Connect { requester, .. }) => Some(requester.identity),
            RpcRequest::Rcon(RconMessage::Accept { .. }) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Relay(RelayResponse),
    Rcon(RconReply),
    Error { message: String },
}
