//! # nat-mapper
//!
//! Discovers NAT gateways on the local network and manages port mappings on
//! them over UPnP IGD (SSDP + SOAP) or NAT-PMP.
//!
//! ## Example
//!
//! ```no_run
//! use nat_mapper::{DiscoveryConfig, Mapping, NatDiscoverer, Protocol};
//!
//! # async fn run() -> nat_mapper::Result<()> {
//! let discoverer = NatDiscoverer::new(DiscoveryConfig::default());
//! let device = discoverer.discover_device().await?;
//!
//! println!("external address: {}", device.external_ip().await?);
//!
//! let mapping = Mapping::with_lifetime(Protocol::TCP, 1600, 1700, 3600, "my service")?;
//! let granted = device.create_port_map(&mapping).await?;
//! println!("mapped {}", granted);
//!
//! // Deletes the leased mappings created above.
//! discoverer.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mapping;
pub mod net;
pub mod pmp;
pub mod searcher;
pub mod upnp;

// Re-exports for convenience
pub use cancel::Cancellation;
pub use config::DiscoveryConfig;
pub use device::{Capabilities, DeviceKey, NatDevice};
pub use discovery::{DeviceRegistry, DiscoveryEvent, DiscoveryState, NatDiscoverer, PortMapper};
pub use error::{Error, Result};
pub use mapping::{Mapping, MappingKey, Protocol};
pub use net::{AddressProvider, NetworkInterface, StaticInterfaces, SystemInterfaces};
pub use pmp::{PmpNatDevice, PmpSearcher};
pub use searcher::Searcher;
pub use upnp::{UpnpNatDevice, UpnpSearcher};
