mod config;
mod crypto;
mod error;
mod identity;
pub mod messages;
mod nat;
mod portmap;
pub mod protocols;
mod rcon;
mod record;
mod relay;

pub use config::{
    ConfigError, NatConfig, DEFAULT_FAILED_RELAY_WAIT_TIME, DEFAULT_MAX_FAIL, DEFAULT_MIN_RELAYS,
    DEFAULT_PEER_MAP_UPDATE_INTERVAL,
};
pub use crypto::{
    Ed25519Scheme, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, PublicKey, Signature, SignatureError,
    SignatureScheme,
};
pub use error::{NatError, RconError, RecordError, RelayError, Stage};
pub use identity::{Identity, Keypair, PeerAddress};
pub use nat::{NatServices, PeerNat, Reachability};
pub use portmap::{ExternalPorts, PortForwardingManager, PortMapping, DYNAMIC_PORT_RANGE};
pub use rcon::{generate_message_id, RconNegotiator};
pub use record::{
    HeaderFlags, Record, Signing, SizeClass, VersionKey, MAX_BASED_ON, MAX_PAYLOAD_LEN,
    VERSION_KEY_SIZE,
};
pub use relay::{MaintenanceHandle, PoolState, RelayPool, RelayPoolSnapshot, RelayState};
