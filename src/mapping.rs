//! Port mapping values.

use crate::error::{Error, Result};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Description attached to mappings that do not set one.
pub const DEFAULT_DESCRIPTION: &str = "nat-mapper";

/// Largest lifetime a mapping may carry. It also marks a mapping as permanent.
pub const MAX_LIFETIME: u32 = i32::MAX as u32;

/// Protocol type for port mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    TCP,
    UDP,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::TCP => "TCP",
            Protocol::UDP => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            p if p.eq_ignore_ascii_case("TCP") => Ok(Protocol::TCP),
            p if p.eq_ignore_ascii_case("UDP") => Ok(Protocol::UDP),
            other => Err(Error::InvalidProtocol(other.to_string())),
        }
    }
}

/// Identity of a mapping on a device: protocol, private port and public port.
///
/// The private IP is not part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub protocol: Protocol,
    pub private_port: u16,
    pub public_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiration {
    Never,
    At(Instant),
}

/// A port forwarding entry in a gateway's translation table.
///
/// A lifetime of `0` or [`MAX_LIFETIME`] makes the mapping permanent: it never
/// expires and is never renewed or released automatically.
#[derive(Debug, Clone)]
pub struct Mapping {
    protocol: Protocol,
    private_ip: Option<IpAddr>,
    private_port: u16,
    public_ip: Option<IpAddr>,
    public_port: u16,
    description: String,
    lifetime: u32,
    expiration: Expiration,
}

impl Mapping {
    /// Create a permanent mapping with the default description.
    pub fn new(protocol: Protocol, private_port: u16, public_port: u16) -> Self {
        Mapping {
            protocol,
            private_ip: None,
            private_port,
            public_ip: None,
            public_port,
            description: DEFAULT_DESCRIPTION.to_string(),
            lifetime: 0,
            expiration: Expiration::At(Instant::now()),
        }
    }

    /// Create a mapping that lives for `lifetime` seconds.
    pub fn with_lifetime(
        protocol: Protocol,
        private_port: u16,
        public_port: u16,
        lifetime: u32,
        description: impl Into<String>,
    ) -> Result<Self> {
        if lifetime > MAX_LIFETIME {
            return Err(Error::OutOfRange {
                field: "lifetime",
                value: lifetime.into(),
            });
        }
        let mut mapping = Mapping::new(protocol, private_port, public_port);
        mapping.description = description.into();
        mapping.set_lifetime(lifetime);
        Ok(mapping)
    }

    /// Build a mapping from unvalidated values, e.g. fields read from a router.
    pub fn from_raw(
        protocol: &str,
        private_port: i64,
        public_port: i64,
        lifetime: i64,
        description: impl Into<String>,
    ) -> Result<Self> {
        let protocol = protocol.parse()?;
        let private_port = port_in_range("private_port", private_port)?;
        let public_port = port_in_range("public_port", public_port)?;
        let lifetime = u32::try_from(lifetime)
            .ok()
            .filter(|l| *l <= MAX_LIFETIME)
            .ok_or(Error::OutOfRange {
                field: "lifetime",
                value: lifetime,
            })?;
        Mapping::with_lifetime(protocol, private_port, public_port, lifetime, description)
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the internal client address the router forwards to.
    pub fn with_private_ip(mut self, ip: IpAddr) -> Self {
        self.private_ip = Some(ip);
        self
    }

    /// Restrict the mapping to a single remote host.
    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn private_ip(&self) -> Option<IpAddr> {
        self.private_ip
    }

    pub fn private_port(&self) -> u16 {
        self.private_port
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        self.public_ip
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Lifetime in seconds.
    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    pub fn key(&self) -> MappingKey {
        MappingKey {
            protocol: self.protocol,
            private_port: self.private_port,
            public_port: self.public_port,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.lifetime == 0 || self.lifetime == MAX_LIFETIME
    }

    /// Permanent mappings never expire.
    pub fn is_expired(&self) -> bool {
        match self.expiration {
            _ if self.is_permanent() => false,
            Expiration::Never => false,
            Expiration::At(at) => Instant::now() >= at,
        }
    }

    /// Remaining lease time, `None` for permanent mappings.
    pub fn time_to_live(&self) -> Option<Duration> {
        match self.expiration {
            _ if self.is_permanent() => None,
            Expiration::Never => None,
            Expiration::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Whether the lease is close enough to expiring that it should be extended.
    pub fn needs_renewal(&self, threshold: Duration) -> bool {
        self.time_to_live().is_some_and(|ttl| ttl < threshold)
    }

    /// Reset the lifetime and recompute the expiration from now.
    pub(crate) fn set_lifetime(&mut self, lifetime: u32) {
        self.lifetime = lifetime.min(MAX_LIFETIME);
        self.expiration = match self.lifetime {
            MAX_LIFETIME => Expiration::Never,
            0 => Expiration::At(Instant::now()),
            secs => Expiration::At(Instant::now() + Duration::from_secs(secs.into())),
        };
    }

    pub(crate) fn set_public_port(&mut self, port: u16) {
        self.public_port = port;
    }

    pub(crate) fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    pub(crate) fn clear_public_ip(&mut self) {
        self.public_ip = None;
    }
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Mapping {}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} --> ", self.protocol, self.public_port)?;
        match self.private_ip {
            Some(ip) => write!(f, "{ip}")?,
            None => f.write_str("*")?,
        }
        write!(f, ":{} ({})", self.private_port, self.description)
    }
}

fn port_in_range(field: &'static str, value: i64) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::OutOfRange { field, value })
}
