//! The probe/receive contract shared by the UPnP and NAT-PMP searchers.

use crate::device::NatDevice;
use crate::error::Result;
use crate::net::SocketSet;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// A protocol-specific gateway searcher.
///
/// The discoverer drives searchers by calling [`receive`](Searcher::receive)
/// and then [`search`](Searcher::search) on every tick.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Short protocol name used in logs.
    fn name(&self) -> &'static str;

    /// Sockets this searcher probes on and listens to.
    fn sockets(&self) -> &SocketSet;

    /// Send probes if this searcher's schedule says one is due.
    ///
    /// A send failure on one socket is logged and the remaining sockets are
    /// still probed.
    async fn search(&self) -> Result<()>;

    /// Parse one datagram. Returns a device only the first time it is seen;
    /// repeat advertisements refresh the known device instead.
    ///
    /// Malformed input is logged and dropped, never returned as an error.
    async fn handle(&self, local: IpAddr, data: &[u8], from: SocketAddr) -> Option<NatDevice>;

    /// Read one pending datagram per socket and hand each to [`handle`](Searcher::handle).
    async fn receive(&self) -> Vec<NatDevice> {
        let mut found = Vec::new();
        for datagram in self.sockets().poll() {
            if let Some(device) = self
                .handle(datagram.local.ip(), &datagram.data, datagram.from)
                .await
            {
                found.push(device);
            }
        }
        found
    }
}

/// When a searcher should probe next.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Schedule {
    next: Instant,
}

impl Schedule {
    /// A schedule that is due immediately.
    pub(crate) fn now() -> Self {
        Schedule {
            next: Instant::now(),
        }
    }

    pub(crate) fn is_due(&self) -> bool {
        Instant::now() >= self.next
    }

    /// Move the next probe to `delay` from now.
    pub(crate) fn defer(&mut self, delay: Duration) {
        self.next = Instant::now() + delay;
    }
}
