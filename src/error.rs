//! Error types for nat-mapper.

use crate::mapping::Protocol;
use thiserror::Error;

/// Result type alias for nat-mapper operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering gateways or managing mappings.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket creation, bind or send failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure talking to a UPnP device.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to deserialize an XML document.
    #[error("failed to parse XML: {0}")]
    XmlParse(#[from] quick_xml::DeError),

    /// Malformed XML in a SOAP response.
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    /// A response parsed but did not contain what was expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The router answered with a `UPnPError` fault.
    #[error("UPnP error {code}: {description}")]
    Upnp { code: u16, description: String },

    /// The gateway answered a NAT-PMP mapping request with a non-zero result code.
    #[error("failed to {operation} port map (protocol={protocol}, private port={private_port}): result code {result_code}")]
    Pmp {
        operation: &'static str,
        protocol: Protocol,
        private_port: u16,
        result_code: u16,
    },

    /// A single request to a device did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Continuous discovery reached its deadline without finding a device.
    #[error("discovery timed out before any device was found")]
    DiscoveryTimeout,

    /// A discovery session ended without finding a device.
    #[error("no NAT device found")]
    DeviceNotFound,

    /// The device's protocol does not offer this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A mapping field is outside its allowed range.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    /// A protocol name other than TCP or UDP.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
}

impl Error {
    /// The UPnP error code, if this is a UPnP fault.
    pub fn upnp_code(&self) -> Option<u16> {
        match self {
            Error::Upnp { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Build an error from a reqwest failure, keeping timeouts distinct.
    pub(crate) fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(err)
        }
    }
}
