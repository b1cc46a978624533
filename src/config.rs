//! Tunables for the reachability layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerAddress;

/// Default interval between routing-table pushes to active relays.
pub const DEFAULT_PEER_MAP_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a failed relay is skipped before it may be retried.
pub const DEFAULT_FAILED_RELAY_WAIT_TIME: Duration = Duration::from_secs(60);

pub const DEFAULT_MIN_RELAYS: usize = 2;
pub const DEFAULT_MAX_FAIL: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Number of relays that must be active for the pool to count as set up.
    pub min_relays: usize,
    /// Relay setup failures tolerated before setup gives up.
    pub max_fail: usize,
    pub peer_map_update_interval: Duration,
    pub failed_relay_wait_time: Duration,
    /// Capacity of the failed-relay backoff table.
    pub failed_relay_capacity: usize,
    /// Upper bound for opening a single relay link.
    pub relay_connect_timeout: Duration,
    /// Wait used by rcon handshakes that ask for a permanent connection.
    pub rcon_default_timeout: Duration,
    /// Try UPnP / NAT-PMP before falling back to relays.
    pub port_forwarding: bool,
    /// Relays to use instead of routing-table candidates.
    pub manual_relays: Vec<PeerAddress>,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            min_relays: DEFAULT_MIN_RELAYS,
            max_fail: DEFAULT_MAX_FAIL,
            peer_map_update_interval: DEFAULT_PEER_MAP_UPDATE_INTERVAL,
            failed_relay_wait_time: DEFAULT_FAILED_RELAY_WAIT_TIME,
            failed_relay_capacity: 1024,
            relay_connect_timeout: Duration::from_secs(10),
            rcon_default_timeout: Duration::from_secs(10),
            port_forwarding: true,
            manual_relays: Vec::new(),
        }
    }
}

impl NatConfig {
    pub fn with_min_relays(mut self, min_relays: usize) -> Self {
        self.min_relays = min_relays;
        self
    }

    pub fn with_max_fail(mut self, max_fail: usize) -> Self {
        self.max_fail = max_fail;
        self
    }

    pub fn with_peer_map_update_interval(mut self, interval: Duration) -> Self {
        self.peer_map_update_interval = interval;
        self
    }

    pub fn with_failed_relay_wait_time(mut self, wait: Duration) -> Self {
        self.failed_relay_wait_time = wait;
        self
    }

    pub fn with_rcon_default_timeout(mut self, timeout: Duration) -> Self {
        self.rcon_default_timeout = timeout;
        self
    }

    pub fn with_port_forwarding(mut self, enabled: bool) -> Self {
        self.port_forwarding = enabled;
        self
    }

    pub fn with_manual_relays(mut self, relays: Vec<PeerAddress>) -> Self {
        self.manual_relays = relays;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_relays == 0 {
            return Err(ConfigError("min_relays must be at least 1".into()));
        }
        if self.peer_map_update_interval.is_zero() {
            return Err(ConfigError("peer_map_update_interval must be non-zero".into()));
        }
        if self.failed_relay_capacity == 0 {
            return Err(ConfigError("failed_relay_capacity must be non-zero".into()));
        }
        if self.relay_connect_timeout.is_zero() || self.rcon_default_timeout.is_zero() {
            return Err(ConfigError("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NatConfig::default();
        assert_eq!(config.min_relays, 2);
        assert_eq!(config.max_fail, 2);
        assert_eq!(config.peer_map_update_interval, Duration::from_secs(5));
        assert_eq!(config.failed_relay_wait_time, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_quorum() {
        let config = NatConfig::default().with_min_relays(0);
        assert!(config.validate().is_err());

        let config = NatConfig::default().with_peer_map_update_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_survives_serialization() {
        let partial = NatConfig {
            min_relays: 3,
            ..Default::default()
        };
        let bytes = bincode::serialize(&partial).unwrap();
        let restored: NatConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.min_relays, 3);
        assert_eq!(restored.max_fail, DEFAULT_MAX_FAIL);
    }
}
