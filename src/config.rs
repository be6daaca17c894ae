//! Discovery and mapping configuration.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// SSDP multicast address.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// SSDP port.
pub const SSDP_PORT: u16 = 1900;

/// Port a NAT-PMP gateway listens on.
pub const PMP_SERVER_PORT: u16 = 5351;

/// Tunables shared by the searchers, the devices and the discoverer.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Pause between two ticks of the poll loop.
    pub tick_interval: Duration,
    /// Continuous discovery stops if nothing was found within this time.
    pub discovery_timeout: Option<Duration>,
    /// How often UPnP probes are repeated while discovery is active.
    pub upnp_search_interval: Duration,
    /// Minimum time between two description fetches for the same source address.
    pub upnp_fetch_throttle: Duration,
    /// Where SSDP probes are sent.
    pub ssdp_target: SocketAddr,
    /// Copies of the probe sent per search cycle.
    pub ssdp_probe_count: usize,
    /// Bound on every SOAP or description request.
    pub soap_timeout: Duration,
    /// Port NAT-PMP requests are sent to on the gateway.
    pub pmp_server_port: u16,
    /// Send attempts for one NAT-PMP mapping exchange.
    pub pmp_retry_attempts: u32,
    /// Period of the mapping renewal timer.
    pub renewal_period: Duration,
    /// Leases with less time left than this are renewed.
    pub renew_threshold: Duration,
    /// Deadline used by [`NatDiscoverer::discover_device`](crate::NatDiscoverer::discover_device).
    pub one_shot_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            tick_interval: Duration::from_millis(10),
            discovery_timeout: None,
            upnp_search_interval: Duration::from_secs(5 * 60),
            upnp_fetch_throttle: Duration::from_secs(20),
            ssdp_target: SocketAddr::V4(SocketAddrV4::new(SSDP_MULTICAST_ADDR, SSDP_PORT)),
            ssdp_probe_count: 3,
            soap_timeout: Duration::from_secs(4),
            pmp_server_port: PMP_SERVER_PORT,
            pmp_retry_attempts: 9,
            renewal_period: Duration::from_secs(30),
            renew_threshold: Duration::from_secs(35),
            one_shot_timeout: Duration::from_secs(3),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    pub fn with_upnp_search_interval(mut self, interval: Duration) -> Self {
        self.upnp_search_interval = interval;
        self
    }

    pub fn with_upnp_fetch_throttle(mut self, throttle: Duration) -> Self {
        self.upnp_fetch_throttle = throttle;
        self
    }

    /// Send probes somewhere other than the SSDP multicast group, e.g. 255.255.255.255:1900.
    pub fn with_ssdp_target(mut self, target: SocketAddr) -> Self {
        self.ssdp_target = target;
        self
    }

    pub fn with_soap_timeout(mut self, timeout: Duration) -> Self {
        self.soap_timeout = timeout;
        self
    }

    pub fn with_pmp_server_port(mut self, port: u16) -> Self {
        self.pmp_server_port = port;
        self
    }

    pub fn with_pmp_retry_attempts(mut self, attempts: u32) -> Self {
        self.pmp_retry_attempts = attempts;
        self
    }

    pub fn with_renewal_period(mut self, period: Duration) -> Self {
        self.renewal_period = period;
        self
    }

    pub fn with_renew_threshold(mut self, threshold: Duration) -> Self {
        self.renew_threshold = threshold;
        self
    }

    pub fn with_one_shot_timeout(mut self, timeout: Duration) -> Self {
        self.one_shot_timeout = timeout;
        self
    }
}
