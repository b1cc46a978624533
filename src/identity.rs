//! Peer identities and advertised addresses.
//!
//! A peer is named by its Ed25519 public key ([`Identity`]). Records signed
//! by a peer carry the same key, so the record codec and the relay layer
//! share one [`Keypair`] type.
//!
//! [`PeerAddress`] is a value: the orchestrator derives new addresses
//! (`with_ports`, `with_ip`, `firewalled`) and publishes them rather than
//! mutating the current one. The rcon handshake addresses a relay on behalf
//! of a firewalled peer with [`PeerAddress::with_identity`].

use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds; record validity is measured from this.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Signing key of the local peer.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn generate() -> Self {
        Keypair(SigningKey::generate(&mut OsRng))
    }

    /// Restores a persisted key.
    pub fn from_secret_key_bytes(secret: &[u8; 32]) -> Self {
        Keypair(SigningKey::from_bytes(secret))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity(self.public_key_bytes())
    }

    pub(crate) fn sign(&self, payload: &[u8]) -> Signature {
        self.0.sign(payload)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.identity().short())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Identity(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes, hex-encoded. Used as the peer field in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Identity(bytes))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

/// The address a peer advertises to the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub identity: Identity,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Inbound TCP connections cannot reach this peer.
    pub firewalled_tcp: bool,
    /// Inbound UDP packets cannot reach this peer.
    pub firewalled_udp: bool,
}

impl PeerAddress {
    pub fn new(identity: Identity, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            identity,
            ip,
            tcp_port,
            udp_port,
            firewalled_tcp: false,
            firewalled_udp: false,
        }
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn with_ports(&self, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            tcp_port,
            udp_port,
            ..self.clone()
        }
    }

    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self { ip, ..self.clone() }
    }

    /// Same socket addresses, different recipient identity.
    pub fn with_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    /// Marks both transports as firewalled, signalling that this peer is
    /// only reachable through relays.
    pub fn firewalled(&self) -> Self {
        Self {
            firewalled_tcp: true,
            firewalled_udp: true,
            ..self.clone()
        }
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled_tcp || self.firewalled_udp
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} (tcp {}, udp {}{})",
            self.identity.short(),
            self.ip,
            self.tcp_port,
            self.udp_port,
            if self.is_firewalled() { ", firewalled" } else { "" }
        )
    }
}
