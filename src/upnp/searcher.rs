//! SSDP search for Internet Gateway Devices.

use super::description::{host_endpoint, parse_description};
use super::ssdp::{encode_search_request, parse_search_response, SERVICE_TYPES};
use super::UpnpNatDevice;
use crate::config::DiscoveryConfig;
use crate::device::{DeviceKey, NatDevice};
use crate::error::{Error, Result};
use crate::net::{AddressProvider, SocketSet};
use crate::searcher::{Schedule, Searcher};
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Finds UPnP gateways by multicasting SSDP searches from every local address.
pub struct UpnpSearcher {
    sockets: SocketSet,
    http: reqwest::Client,
    target: SocketAddr,
    probe_count: usize,
    search_interval: Duration,
    fetch_throttle: Duration,
    schedule: Mutex<Schedule>,
    devices: Mutex<HashMap<DeviceKey, NatDevice>>,
    last_fetched: Mutex<HashMap<IpAddr, Instant>>,
}

impl UpnpSearcher {
    /// Bind one socket per local unicast address.
    ///
    /// If the addresses cannot be enumerated, or none of them binds, a single
    /// wildcard socket is used.
    pub fn new(provider: &dyn AddressProvider, config: &DiscoveryConfig) -> Result<Self> {
        let addrs = provider.unicast_addresses().unwrap_or_else(|e| {
            tracing::warn!("Failed to enumerate local addresses: {}", e);
            Vec::new()
        });
        let sockets = SocketSet::bind_all(&addrs)?;
        UpnpSearcher::with_sockets(sockets, config)
    }

    pub fn with_sockets(sockets: SocketSet, config: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.soap_timeout)
            .build()?;
        Ok(UpnpSearcher {
            sockets,
            http,
            target: config.ssdp_target,
            probe_count: config.ssdp_probe_count,
            search_interval: config.upnp_search_interval,
            fetch_throttle: config.upnp_fetch_throttle,
            schedule: Mutex::new(Schedule::now()),
            devices: Mutex::new(HashMap::new()),
            last_fetched: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a description fetch for `source` is allowed now. Records the
    /// fetch when it is.
    async fn claim_fetch(&self, source: IpAddr) -> bool {
        let mut last_fetched = self.last_fetched.lock().await;
        if let Some(last) = last_fetched.get(&source) {
            if last.elapsed() < self.fetch_throttle {
                return false;
            }
        }
        last_fetched.insert(source, Instant::now());
        true
    }

    /// Fetch the description document and build a device for the advertised
    /// service.
    async fn fetch_device(
        &self,
        local: IpAddr,
        location: Url,
        advertised: &'static str,
    ) -> Result<UpnpNatDevice> {
        tracing::debug!("Fetching service list from {}", location);
        let response = self
            .http
            .get(location.clone())
            .header("ACCEPT-LANGUAGE", "en")
            .send()
            .await
            .map_err(Error::from_http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!(
                "couldn't get services list from {}: HTTP {}",
                location, status
            )));
        }
        let body = response.text().await.map_err(Error::from_http)?;
        let root = parse_description(&body)?;

        let service = std::iter::once(advertised)
            .chain(SERVICE_TYPES)
            .find_map(|service_type| root.find_service(service_type))
            .ok_or_else(|| {
                Error::InvalidResponse(format!("{} lists no WAN connection service", location))
            })?;
        tracing::debug!(
            "Found {} at {} on {}",
            service.service_type.trim(),
            service.control_url.trim(),
            location
        );

        UpnpNatDevice::new(
            self.http.clone(),
            local,
            location,
            &service.control_url,
            service.service_type.trim(),
        )
    }
}

#[async_trait]
impl Searcher for UpnpSearcher {
    fn name(&self) -> &'static str {
        "upnp"
    }

    fn sockets(&self) -> &SocketSet {
        &self.sockets
    }

    async fn search(&self) -> Result<()> {
        {
            let mut schedule = self.schedule.lock().await;
            if !schedule.is_due() {
                return Ok(());
            }
            schedule.defer(self.search_interval);
        }

        let request = encode_search_request(self.target);
        for socket in self.sockets.sockets() {
            // UDP is unreliable, so every probe goes out several times.
            for _ in 0..self.probe_count {
                if let Err(e) = socket.send_to(request.as_bytes(), self.target).await {
                    tracing::warn!("SSDP search to {} failed: {}", self.target, e);
                    break;
                }
            }
        }
        tracing::trace!("Sent SSDP search on {} sockets", self.sockets.len());
        Ok(())
    }

    async fn handle(&self, local: IpAddr, data: &[u8], from: SocketAddr) -> Option<NatDevice> {
        let text = String::from_utf8_lossy(data);
        let Some(response) = parse_search_response(&text) else {
            tracing::trace!("Ignoring SSDP response from {} without a gateway service", from);
            return None;
        };
        tracing::debug!("{} advertised {}", from, response.service_type);

        let location = match Url::parse(&response.location) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("Bad location {:?} from {}: {}", response.location, from, e);
                return None;
            }
        };
        let host = match host_endpoint(&location) {
            Ok(host) => host,
            Err(e) => {
                tracing::debug!("Bad location from {}: {}", from, e);
                return None;
            }
        };
        let key = DeviceKey::Upnp {
            host,
            description_path: location.path().to_string(),
        };

        if let Some(device) = self.devices.lock().await.get(&key) {
            tracing::trace!("Already found {}", key);
            device.touch().await;
            return None;
        }

        // Each search goes out several times; fetch once per burst.
        if !self.claim_fetch(from.ip()).await {
            tracing::trace!("Throttled description fetch for {}", from);
            return None;
        }

        let local = route_local_ip(local, from);
        match self.fetch_device(local, location, response.service_type).await {
            Ok(device) => {
                let device = NatDevice::from(device);
                tracing::info!("Found {}", device);
                self.devices.lock().await.insert(key, device.clone());
                Some(device)
            }
            Err(e) => {
                tracing::warn!("Found device at {} couldn't be configured: {}", from, e);
                None
            }
        }
    }
}

/// The local address used to reach `peer`, for sockets bound to the wildcard.
fn route_local_ip(local: IpAddr, peer: SocketAddr) -> IpAddr {
    if !local.is_unspecified() {
        return local;
    }
    std::net::UdpSocket::bind(SocketAddr::new(local, 0))
        .and_then(|socket| {
            socket.connect(peer)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(local)
}
