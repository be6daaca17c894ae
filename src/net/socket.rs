//! UDP socket creation and non-blocking polling.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Large enough for any SSDP or NAT-PMP datagram.
const RECV_BUFFER_SIZE: usize = 4096;

/// Bind a UDP socket to `local` for unicast, broadcast and multicast sends.
///
/// Must be called from within a tokio runtime.
pub fn bind_udp(local: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // Not every interface supports these; unicast still works without them.
    if let Err(e) = socket.set_broadcast(true) {
        tracing::trace!("set_broadcast failed on {}: {}", local, e);
    }
    if !local.ip().is_unspecified() {
        if let Err(e) = socket.set_multicast_if_v4(local.ip()) {
            tracing::trace!("set_multicast_if_v4 failed on {}: {}", local, e);
        }
    }

    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}

/// A datagram read from one socket of a [`SocketSet`].
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Local address of the socket that received it.
    pub local: SocketAddr,
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

/// One socket per local address, owned by a searcher for a discovery run.
#[derive(Debug, Default)]
pub struct SocketSet {
    sockets: Vec<Arc<UdpSocket>>,
}

impl SocketSet {
    /// Bind an ephemeral-port socket on each address.
    ///
    /// Addresses that fail to bind are skipped. If none bind, a single socket
    /// on the wildcard address is used instead.
    pub fn bind_all(addrs: &[Ipv4Addr]) -> io::Result<Self> {
        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match bind_udp(SocketAddrV4::new(*addr, 0)) {
                Ok(socket) => sockets.push(Arc::new(socket)),
                Err(e) => tracing::warn!("Skipping {}: bind failed: {}", addr, e),
            }
        }

        if sockets.is_empty() {
            tracing::debug!("No per-address socket bound, falling back to wildcard");
            sockets.push(Arc::new(bind_udp(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                0,
            ))?));
        }

        Ok(SocketSet { sockets })
    }

    pub fn from_sockets(sockets: Vec<Arc<UdpSocket>>) -> Self {
        SocketSet { sockets }
    }

    pub fn push(&mut self, socket: Arc<UdpSocket>) {
        self.sockets.push(socket);
    }

    pub fn sockets(&self) -> &[Arc<UdpSocket>] {
        &self.sockets
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Read at most one pending datagram from every socket without blocking.
    ///
    /// Sockets with nothing pending are skipped; receive errors are logged and
    /// the socket is skipped for this round.
    pub fn poll(&self) -> Vec<Datagram> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut received = Vec::new();

        for socket in &self.sockets {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    let local = match socket.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            tracing::debug!("Dropping datagram from {}: {}", from, e);
                            continue;
                        }
                    };
                    received.push(Datagram {
                        local,
                        from,
                        data: buf[..len].to_vec(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => tracing::debug!("Receive error: {}", e),
            }
        }

        received
    }
}
