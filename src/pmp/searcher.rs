//! NAT-PMP search for default gateways.

use super::protocol::{
    decode_external_address_response, encode_external_address_request, Backoff, BackoffStep,
    REFRESH_AFTER_SUCCESS, RESULT_SUCCESS,
};
use super::PmpNatDevice;
use crate::config::DiscoveryConfig;
use crate::device::NatDevice;
use crate::error::Result;
use crate::net::{bind_udp, AddressProvider, SocketSet};
use crate::searcher::{Schedule, Searcher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

struct SearchState {
    backoff: Backoff,
    schedule: Schedule,
}

/// Finds NAT-PMP gateways by asking each default gateway for its external address.
pub struct PmpSearcher {
    sockets: SocketSet,
    /// Gateway endpoints reachable from each socket, by socket index.
    gateways: Vec<Vec<SocketAddr>>,
    retry_attempts: u32,
    state: Mutex<SearchState>,
    devices: Mutex<HashMap<Ipv4Addr, NatDevice>>,
}

impl PmpSearcher {
    /// Bind one socket per local address on every interface that has a
    /// gateway. Interfaces without one are skipped; DNS servers stand in for
    /// gateways on platforms that do not report them.
    pub fn new(provider: &dyn AddressProvider, config: &DiscoveryConfig) -> Result<Self> {
        let mut routes = Vec::new();
        for iface in provider.interfaces()? {
            let gateways: Vec<SocketAddr> = iface
                .gateway_candidates()
                .iter()
                .map(|gw| SocketAddr::V4(SocketAddrV4::new(*gw, config.pmp_server_port)))
                .collect();
            if gateways.is_empty() {
                tracing::trace!("Skipping {}: no gateway", iface.name);
                continue;
            }

            for addr in &iface.unicast {
                match bind_udp(SocketAddrV4::new(*addr, 0)) {
                    Ok(socket) => routes.push((Arc::new(socket), gateways.clone())),
                    Err(e) => tracing::warn!("Skipping {}: bind failed: {}", addr, e),
                }
            }
        }
        Ok(PmpSearcher::with_routes(routes, config))
    }

    /// Use already bound sockets, each with the gateways it should probe.
    pub fn with_routes(routes: Vec<(Arc<UdpSocket>, Vec<SocketAddr>)>, config: &DiscoveryConfig) -> Self {
        let (sockets, gateways): (Vec<_>, Vec<_>) = routes.into_iter().unzip();
        PmpSearcher {
            sockets: SocketSet::from_sockets(sockets),
            gateways,
            retry_attempts: config.pmp_retry_attempts,
            state: Mutex::new(SearchState {
                backoff: Backoff::new(),
                schedule: Schedule::now(),
            }),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn is_search_address(&self, ip: IpAddr) -> bool {
        self.gateways.iter().flatten().any(|gw| gw.ip() == ip)
    }
}

#[async_trait]
impl Searcher for PmpSearcher {
    fn name(&self) -> &'static str {
        "pmp"
    }

    fn sockets(&self) -> &SocketSet {
        &self.sockets
    }

    async fn search(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.schedule.is_due() {
                return Ok(());
            }
            match state.backoff.step() {
                BackoffStep::Rest(idle) => {
                    tracing::debug!("No NAT-PMP gateway answered, next search in {:?}", idle);
                    state.schedule.defer(idle);
                    return Ok(());
                }
                BackoffStep::Probe(wait) => state.schedule.defer(wait),
            }
        }

        let request = encode_external_address_request();
        for (socket, gateways) in self.sockets.sockets().iter().zip(&self.gateways) {
            for gateway in gateways {
                if let Err(e) = socket.send_to(&request, gateway).await {
                    tracing::warn!("NAT-PMP search to {} failed: {}", gateway, e);
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, local: IpAddr, data: &[u8], from: SocketAddr) -> Option<NatDevice> {
        if !self.is_search_address(from.ip()) {
            tracing::trace!("Ignoring datagram from non-gateway {}", from);
            return None;
        }
        let Some(response) = decode_external_address_response(data) else {
            tracing::trace!("Ignoring malformed NAT-PMP response from {}", from);
            return None;
        };
        if response.result_code != RESULT_SUCCESS {
            tracing::debug!("Non-zero NAT-PMP result code {} from {}", response.result_code, from);
        }

        {
            let mut state = self.state.lock().await;
            state.backoff.reset();
            state.schedule.defer(REFRESH_AFTER_SUCCESS);
        }

        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get(&response.external_ip) {
            tracing::trace!("Already found {}", device);
            device.touch().await;
            return None;
        }

        let device = NatDevice::from(PmpNatDevice::new(
            local,
            from,
            response.external_ip,
            self.retry_attempts,
        ));
        tracing::info!("Found {}", device);
        devices.insert(response.external_ip, device.clone());
        Some(device)
    }
}
