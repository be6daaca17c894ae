//! The protocol-neutral device handle.

use crate::error::{Error, Result};
use crate::mapping::{Mapping, MappingKey, Protocol};
use crate::pmp::PmpNatDevice;
use crate::upnp::UpnpNatDevice;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Identity of a device in the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    /// Host and path of the description document.
    Upnp {
        host: SocketAddr,
        description_path: String,
    },
    /// External address reported by the gateway.
    Pmp(IpAddr),
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Upnp {
                host,
                description_path,
            } => write!(f, "upnp://{}{}", host, description_path),
            DeviceKey::Pmp(ip) => write!(f, "pmp://{}", ip),
        }
    }
}

/// Operations a device supports beyond create, delete and external address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// [`NatDevice::get_all_mappings`] is available.
    pub listing: bool,
    /// [`NatDevice::get_specific_mapping`] is available.
    pub specific_lookup: bool,
}

/// Per-device bookkeeping: when the device was last heard from and which
/// mappings this process created on it.
#[derive(Debug)]
pub(crate) struct DeviceState {
    last_seen: RwLock<Instant>,
    owned: RwLock<HashMap<MappingKey, Mapping>>,
}

impl DeviceState {
    pub(crate) fn new() -> Self {
        DeviceState {
            last_seen: RwLock::new(Instant::now()),
            owned: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn touch(&self) {
        *self.last_seen.write().await = Instant::now();
    }

    pub(crate) async fn last_seen(&self) -> Instant {
        *self.last_seen.read().await
    }

    pub(crate) async fn track(&self, mapping: Mapping) {
        self.owned.write().await.insert(mapping.key(), mapping);
    }

    pub(crate) async fn untrack(&self, key: &MappingKey) -> Option<Mapping> {
        self.owned.write().await.remove(key)
    }

    pub(crate) async fn owned(&self) -> Vec<Mapping> {
        self.owned.read().await.values().cloned().collect()
    }
}

/// A discovered gateway.
///
/// Cloning is cheap; clones share the same device.
#[derive(Debug, Clone)]
pub enum NatDevice {
    Upnp(Arc<UpnpNatDevice>),
    Pmp(Arc<PmpNatDevice>),
}

impl NatDevice {
    pub fn key(&self) -> DeviceKey {
        match self {
            NatDevice::Upnp(device) => {
                let url = device.description_url();
                let host = crate::upnp::description::host_endpoint(url)
                    .unwrap_or_else(|_| device.host_endpoint());
                DeviceKey::Upnp {
                    host,
                    description_path: url.path().to_string(),
                }
            }
            NatDevice::Pmp(device) => DeviceKey::Pmp(IpAddr::V4(device.external_ip())),
        }
    }

    /// Local address the device was discovered from.
    pub fn local_address(&self) -> IpAddr {
        match self {
            NatDevice::Upnp(device) => device.local_address(),
            NatDevice::Pmp(device) => device.local_address(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            NatDevice::Upnp(_) => Capabilities {
                listing: true,
                specific_lookup: true,
            },
            NatDevice::Pmp(_) => Capabilities {
                listing: false,
                specific_lookup: false,
            },
        }
    }

    pub(crate) fn state(&self) -> &DeviceState {
        match self {
            NatDevice::Upnp(device) => &device.state,
            NatDevice::Pmp(device) => &device.state,
        }
    }

    /// Record that the device was heard from again.
    pub async fn touch(&self) {
        self.state().touch().await;
    }

    pub async fn last_seen(&self) -> Instant {
        self.state().last_seen().await
    }

    /// Mappings created through this handle that have not been deleted.
    pub async fn owned_mappings(&self) -> Vec<Mapping> {
        self.state().owned().await
    }

    pub async fn external_ip(&self) -> Result<IpAddr> {
        match self {
            NatDevice::Upnp(device) => device.external_ip().await,
            NatDevice::Pmp(device) => Ok(IpAddr::V4(device.external_ip())),
        }
    }

    /// Create a mapping. The returned mapping reflects what the gateway
    /// granted and is tracked for renewal and release.
    pub async fn create_port_map(&self, mapping: &Mapping) -> Result<Mapping> {
        let granted = match self {
            NatDevice::Upnp(device) => device.create_port_map(mapping).await?,
            NatDevice::Pmp(device) => device.create_port_map(mapping).await?,
        };
        if granted.key() != mapping.key() {
            self.state().untrack(&mapping.key()).await;
        }
        self.state().track(granted.clone()).await;
        Ok(granted)
    }

    pub async fn delete_port_map(&self, mapping: &Mapping) -> Result<()> {
        match self {
            NatDevice::Upnp(device) => device.delete_port_map(mapping).await?,
            NatDevice::Pmp(device) => device.delete_port_map(mapping).await?,
        }
        self.state().untrack(&mapping.key()).await;
        Ok(())
    }

    /// All mappings in the gateway's table.
    ///
    /// Fails with [`Error::Unsupported`] on NAT-PMP gateways.
    pub async fn get_all_mappings(&self) -> Result<Vec<Mapping>> {
        match self {
            NatDevice::Upnp(device) => device.get_all_mappings().await,
            NatDevice::Pmp(_) => Err(Error::Unsupported("NAT-PMP cannot list mappings")),
        }
    }

    /// The mapping for a public port, or `None` if there is none.
    ///
    /// Fails with [`Error::Unsupported`] on NAT-PMP gateways.
    pub async fn get_specific_mapping(
        &self,
        protocol: Protocol,
        public_port: u16,
    ) -> Result<Option<Mapping>> {
        match self {
            NatDevice::Upnp(device) => device.get_specific_mapping(protocol, public_port).await,
            NatDevice::Pmp(_) => Err(Error::Unsupported(
                "NAT-PMP cannot look up a single mapping",
            )),
        }
    }

    /// Re-create owned leased mappings with less than `threshold` left.
    ///
    /// Permanent mappings are skipped. Failures are logged and the mapping
    /// stays tracked so the next pass tries again. Returns how many mappings
    /// were renewed.
    pub async fn renew_mappings(&self, threshold: Duration) -> usize {
        let mut renewed = 0;
        for mapping in self.owned_mappings().await {
            if mapping.is_permanent() || !mapping.needs_renewal(threshold) {
                continue;
            }
            match self.create_port_map(&mapping).await {
                Ok(granted) => {
                    tracing::debug!("Renewed {} on {}", granted, self);
                    renewed += 1;
                }
                Err(e) => tracing::warn!("Failed to renew {} on {}: {}", mapping, self, e),
            }
        }
        renewed
    }

    /// Delete every owned leased mapping, best effort.
    ///
    /// Deletes run concurrently, and NAT-PMP deletes use a shorter retry
    /// budget than [`delete_port_map`](NatDevice::delete_port_map), so a
    /// silent gateway holds up shutdown for seconds rather than minutes.
    /// Permanent mappings are left on the gateway. Failures are logged, never
    /// returned, and the mapping is forgotten. Returns how many mappings were
    /// deleted.
    pub async fn release_all(&self) -> usize {
        let mut deletes = JoinSet::new();
        for mapping in self.owned_mappings().await {
            if mapping.is_permanent() {
                continue;
            }
            let device = self.clone();
            deletes.spawn(async move {
                let result = device.release(&mapping).await;
                (mapping, result)
            });
        }

        let mut released = 0;
        while let Some(joined) = deletes.join_next().await {
            match joined {
                Ok((mapping, Ok(()))) => {
                    self.state().untrack(&mapping.key()).await;
                    released += 1;
                }
                Ok((mapping, Err(e))) => {
                    tracing::warn!("Failed to release {} on {}: {}", mapping, self, e);
                    self.state().untrack(&mapping.key()).await;
                }
                Err(e) => tracing::error!("Release task failed: {}", e),
            }
        }
        released
    }

    async fn release(&self, mapping: &Mapping) -> Result<()> {
        match self {
            NatDevice::Upnp(device) => device.delete_port_map(mapping).await,
            NatDevice::Pmp(device) => device.release_port_map(mapping).await,
        }
    }
}

impl fmt::Display for NatDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatDevice::Upnp(device) => fmt::Display::fmt(device.as_ref(), f),
            NatDevice::Pmp(device) => fmt::Display::fmt(device.as_ref(), f),
        }
    }
}

impl From<UpnpNatDevice> for NatDevice {
    fn from(device: UpnpNatDevice) -> Self {
        NatDevice::Upnp(Arc::new(device))
    }
}

impl From<PmpNatDevice> for NatDevice {
    fn from(device: PmpNatDevice) -> Self {
        NatDevice::Pmp(Arc::new(device))
    }
}
