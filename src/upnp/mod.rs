//! UPnP Internet Gateway Device client.
//!
//! Gateways are found with SSDP, described by their `rootDesc.xml` and
//! controlled through SOAP calls to a WANIPConnection or WANPPPConnection
//! service.

pub mod action;
pub mod description;
mod device;
mod searcher;
pub mod soap;
pub mod ssdp;

pub use device::UpnpNatDevice;
pub use searcher::UpnpSearcher;
