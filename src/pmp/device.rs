//! A gateway that answered a NAT-PMP probe.

use super::protocol::{
    decode_mapping_response, MappingRequest, MappingResponse, INITIAL_RETRY_DELAY,
    RESULT_SUCCESS,
};
use crate::device::DeviceState;
use crate::error::{Error, Result};
use crate::mapping::{Mapping, MAX_LIFETIME};
use crate::net::bind_udp;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Attempts per delete when releasing on shutdown, 3.75 s in total.
const RELEASE_RETRY_ATTEMPTS: u32 = 4;

/// A NAT-PMP gateway.
///
/// NAT-PMP can create and delete mappings but cannot list them.
#[derive(Debug)]
pub struct PmpNatDevice {
    local_address: IpAddr,
    gateway: SocketAddr,
    external_ip: Ipv4Addr,
    retry_attempts: u32,
    pub(crate) state: DeviceState,
}

impl PmpNatDevice {
    pub fn new(
        local_address: IpAddr,
        gateway: SocketAddr,
        external_ip: Ipv4Addr,
        retry_attempts: u32,
    ) -> Self {
        PmpNatDevice {
            local_address,
            gateway,
            external_ip,
            retry_attempts,
            state: DeviceState::new(),
        }
    }

    /// Local address the gateway was discovered from.
    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// The gateway's NAT-PMP endpoint.
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// External address reported when the gateway was discovered.
    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    /// Request a mapping. The returned mapping carries the public port,
    /// protocol and lifetime the gateway actually granted.
    ///
    /// Permanent mappings are requested with the largest lifetime the protocol
    /// allows; the gateway may grant less.
    pub async fn create_port_map(&self, mapping: &Mapping) -> Result<Mapping> {
        let lifetime = if mapping.is_permanent() {
            MAX_LIFETIME
        } else {
            mapping.lifetime()
        };
        let request = MappingRequest {
            protocol: mapping.protocol(),
            private_port: mapping.private_port(),
            public_port: mapping.public_port(),
            lifetime,
        };

        let response = self.exchange(request, "create", self.retry_attempts).await?;
        if response.lifetime == 0 {
            return Err(Error::InvalidResponse(format!(
                "gateway {} granted no lifetime for {}",
                self.gateway, mapping
            )));
        }

        let mut granted = mapping.clone();
        granted.set_public_port(response.public_port);
        granted.set_protocol(response.protocol);
        granted.set_lifetime(response.lifetime);
        tracing::debug!("Created {} on {}", granted, self.gateway);
        Ok(granted)
    }

    /// Remove a mapping by requesting a zero lifetime.
    pub async fn delete_port_map(&self, mapping: &Mapping) -> Result<()> {
        self.delete_with_attempts(mapping, self.retry_attempts).await
    }

    /// Remove a mapping with the short attempt budget used when releasing
    /// everything on shutdown.
    pub(crate) async fn release_port_map(&self, mapping: &Mapping) -> Result<()> {
        self.delete_with_attempts(mapping, RELEASE_RETRY_ATTEMPTS.min(self.retry_attempts))
            .await
    }

    async fn delete_with_attempts(&self, mapping: &Mapping, attempts: u32) -> Result<()> {
        let request = MappingRequest {
            protocol: mapping.protocol(),
            private_port: mapping.private_port(),
            public_port: 0,
            lifetime: 0,
        };
        self.exchange(request, "delete", attempts).await?;
        tracing::debug!("Deleted {} on {}", mapping, self.gateway);
        Ok(())
    }

    /// Send `request` with retries while listening for the answer.
    ///
    /// The first matching response wins; the retries stop with it.
    async fn exchange(
        &self,
        request: MappingRequest,
        operation: &'static str,
        attempts: u32,
    ) -> Result<MappingResponse> {
        let bind_ip = match self.local_address {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let socket = bind_udp(SocketAddrV4::new(bind_ip, 0))?;
        let packet = request.encode();

        tokio::select! {
            response = self.listen(&socket, &request, operation) => response,
            timed_out = self.send_with_retries(&socket, &packet, attempts) => timed_out,
        }
    }

    async fn send_with_retries(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        attempts: u32,
    ) -> Result<MappingResponse> {
        let mut delay = INITIAL_RETRY_DELAY;
        for attempt in 1..=attempts {
            tracing::trace!("Mapping request attempt {} to {}", attempt, self.gateway);
            socket.send_to(packet, self.gateway).await?;
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        tracing::debug!(
            "No mapping response from {} after {} attempts",
            self.gateway,
            attempts
        );
        Err(Error::Timeout)
    }

    async fn listen(
        &self,
        socket: &UdpSocket,
        request: &MappingRequest,
        operation: &'static str,
    ) -> Result<MappingResponse> {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from.ip() != self.gateway.ip() {
                tracing::trace!("Ignoring datagram from {}", from);
                continue;
            }
            let Some(response) = decode_mapping_response(&buf[..len]) else {
                tracing::trace!("Ignoring malformed mapping response from {}", from);
                continue;
            };
            if !request.matches(&response) {
                continue;
            }
            if response.result_code != RESULT_SUCCESS {
                return Err(Error::Pmp {
                    operation,
                    protocol: request.protocol,
                    private_port: request.private_port,
                    result_code: response.result_code,
                });
            }
            return Ok(response);
        }
    }
}

impl fmt::Display for PmpNatDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NAT-PMP gateway {} (local {}, external {})",
            self.gateway, self.local_address, self.external_ip
        )
    }
}
