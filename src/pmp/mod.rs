//! NAT-PMP client (RFC 6886).

mod device;
pub mod protocol;
mod searcher;

pub use device::PmpNatDevice;
pub use searcher::PmpSearcher;
