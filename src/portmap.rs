//! Automatic port forwarding.
//!
//! [`PortForwardingManager`] asks the gateway to forward a pair of freshly
//! drawn external ports to the node's internal TCP and UDP ports. Mappers are
//! tried in order (UPnP first, then NAT-PMP); the first one that reports a
//! mapping wins. The manager never touches the node's advertised address,
//! that is left to the orchestrator.

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocols::PortMapper;

/// IANA dynamic / private port range.
pub const DYNAMIC_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalPorts {
    pub tcp: u16,
    pub udp: u16,
}

impl ExternalPorts {
    /// Draws both ports at random from [`DYNAMIC_PORT_RANGE`].
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            tcp: rng.gen_range(DYNAMIC_PORT_RANGE),
            udp: rng.gen_range(DYNAMIC_PORT_RANGE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub internal_host: IpAddr,
    pub internal_tcp: u16,
    pub internal_udp: u16,
    pub external: ExternalPorts,
}

pub struct PortForwardingManager {
    mappers: Vec<Arc<dyn PortMapper>>,
    active: Mutex<Vec<(Arc<dyn PortMapper>, PortMapping)>>,
}

impl PortForwardingManager {
    /// `mappers` are tried in the given order.
    pub fn new(mappers: Vec<Arc<dyn PortMapper>>) -> Self {
        Self {
            mappers,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Tries every mapper in turn. Returns the external ports of the first
    /// mapping that succeeded, `None` if no mapper could map them.
    pub async fn attempt(
        &self,
        internal_host: IpAddr,
        internal_tcp: u16,
        internal_udp: u16,
    ) -> Option<ExternalPorts> {
        let mapping = PortMapping {
            internal_host,
            internal_tcp,
            internal_udp,
            external: ExternalPorts::random(),
        };

        for mapper in &self.mappers {
            match mapper.map(&mapping).await {
                Ok(true) => {
                    info!(
                        protocol = mapper.name(),
                        tcp = mapping.external.tcp,
                        udp = mapping.external.udp,
                        "port forwarding established"
                    );
                    let external = mapping.external;
                    self.active.lock().await.push((mapper.clone(), mapping));
                    return Some(external);
                }
                Ok(false) => {
                    warn!(protocol = mapper.name(), "no capable devices found");
                }
                Err(e) => {
                    warn!(protocol = mapper.name(), error = %e, "port mapping failed");
                }
            }
        }
        None
    }

    /// Removes every mapping this manager created. Safe to call repeatedly.
    pub async fn release(&self) {
        let mappings = std::mem::take(&mut *self.active.lock().await);
        for (mapper, mapping) in mappings {
            if let Err(e) = mapper.unmap(&mapping).await {
                debug!(protocol = mapper.name(), error = %e, "failed to remove port mapping");
            }
        }
    }

    pub async fn active_mappings(&self) -> usize {
        self.active.lock().await.len()
    }
}

impl std::fmt::Debug for PortForwardingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.mappers.iter().map(|m| m.name()).collect();
        f.debug_struct("PortForwardingManager")
            .field("mappers", &names)
            .finish_non_exhaustive()
    }
}
