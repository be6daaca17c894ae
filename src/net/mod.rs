//! Local network information and UDP transport.

mod socket;

pub use socket::{bind_udp, Datagram, SocketSet};

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

/// One active network interface and the IPv4 addresses reachable through it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    /// Local unicast addresses bound to the interface.
    pub unicast: Vec<Ipv4Addr>,
    /// Default gateways routed through the interface.
    pub gateways: Vec<Ipv4Addr>,
    /// DNS servers. Used as gateway candidates when no gateway is known.
    pub dns_servers: Vec<Ipv4Addr>,
}

impl NetworkInterface {
    /// Gateways, or DNS servers if the platform reported no gateway.
    pub fn gateway_candidates(&self) -> &[Ipv4Addr] {
        if self.gateways.is_empty() {
            &self.dns_servers
        } else {
            &self.gateways
        }
    }
}

/// Source of local interface information.
pub trait AddressProvider: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>>;

    /// All local unicast IPv4 addresses.
    fn unicast_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
        Ok(self
            .interfaces()?
            .into_iter()
            .flat_map(|iface| iface.unicast)
            .collect())
    }
}

/// Reads interfaces from the operating system.
///
/// Unicast addresses come from `if-addrs`. Gateways and DNS servers come from
/// `netdev`, matched by interface name, with the system default gateway
/// standing in when no interface reports one of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl AddressProvider for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        let mut by_name: BTreeMap<String, NetworkInterface> = BTreeMap::new();
        for iface in if_addrs::get_if_addrs()? {
            if iface.is_loopback() {
                continue;
            }
            let IpAddr::V4(ip) = iface.ip() else {
                continue;
            };
            by_name
                .entry(iface.name.clone())
                .or_insert_with(|| NetworkInterface {
                    name: iface.name.clone(),
                    ..Default::default()
                })
                .unicast
                .push(ip);
        }

        let routes: Vec<RouteInfo> = netdev::get_interfaces()
            .into_iter()
            .map(|iface| RouteInfo {
                gateways: iface.gateway.map(|gw| gw.ipv4).unwrap_or_default(),
                dns_servers: iface
                    .dns_servers
                    .iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect(),
                name: iface.name,
            })
            .collect();
        let default_gateway = match netdev::get_default_gateway() {
            Ok(gw) => gw.ipv4.first().copied(),
            Err(e) => {
                tracing::debug!("No default gateway: {}", e);
                None
            }
        };
        apply_routes(&mut by_name, &routes, default_gateway);

        Ok(by_name.into_values().collect())
    }
}

/// Gateway information the platform reports for one interface.
#[derive(Debug, Clone, Default)]
struct RouteInfo {
    name: String,
    gateways: Vec<Ipv4Addr>,
    dns_servers: Vec<Ipv4Addr>,
}

fn apply_routes(
    by_name: &mut BTreeMap<String, NetworkInterface>,
    routes: &[RouteInfo],
    default_gateway: Option<Ipv4Addr>,
) {
    for route in routes {
        if let Some(iface) = by_name.get_mut(&route.name) {
            iface.gateways = route
                .gateways
                .iter()
                .copied()
                .filter(|gw| !gw.is_unspecified())
                .collect();
            iface.dns_servers = route
                .dns_servers
                .iter()
                .copied()
                .filter(|ip| !ip.is_loopback())
                .collect();
        }
    }

    if by_name.values().all(|iface| iface.gateways.is_empty()) {
        if let Some(gateway) = default_gateway {
            for iface in by_name.values_mut() {
                iface.gateways.push(gateway);
            }
        }
    }
}

/// A fixed interface list, for hosts where the addresses are already known.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Vec<NetworkInterface>,
}

impl StaticInterfaces {
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        StaticInterfaces { interfaces }
    }

    /// A single interface with one address and one gateway.
    pub fn single(local: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        StaticInterfaces::new(vec![NetworkInterface {
            name: "static0".to_string(),
            unicast: vec![local],
            gateways: gateway.into_iter().collect(),
            dns_servers: Vec::new(),
        }])
    }
}

impl AddressProvider for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        Ok(self.interfaces.clone())
    }
}
