//! WANIPConnection / WANPPPConnection actions.

use super::soap::SoapResponse;
use crate::error::Result;
use crate::mapping::{Mapping, Protocol};
use std::net::IpAddr;

/// A control action with its input arguments.
#[derive(Debug, Clone)]
pub enum Action {
    /// Get the external IP address of the gateway.
    GetExternalIPAddress,

    /// Add a port mapping.
    AddPortMapping(AddPortMappingParams),

    /// Delete a port mapping.
    DeletePortMapping(PortMappingParams),

    /// Get a port mapping entry by index.
    GetGenericPortMappingEntry { index: u32 },

    /// Get the port mapping entry for an external port and protocol.
    GetSpecificPortMappingEntry(PortMappingParams),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::GetExternalIPAddress => "GetExternalIPAddress",
            Action::AddPortMapping(_) => "AddPortMapping",
            Action::DeletePortMapping(_) => "DeletePortMapping",
            Action::GetGenericPortMappingEntry { .. } => "GetGenericPortMappingEntry",
            Action::GetSpecificPortMappingEntry(_) => "GetSpecificPortMappingEntry",
        }
    }

    /// Input arguments in the order the service definition lists them.
    pub fn args(&self) -> Vec<(&'static str, String)> {
        match self {
            Action::GetExternalIPAddress => Vec::new(),
            Action::AddPortMapping(params) => vec![
                ("NewRemoteHost", remote_host(params.remote_host)),
                ("NewExternalPort", params.external_port.to_string()),
                ("NewProtocol", params.protocol.to_string()),
                ("NewInternalPort", params.internal_port.to_string()),
                ("NewInternalClient", params.internal_client.to_string()),
                ("NewEnabled", if params.enabled { "1" } else { "0" }.to_string()),
                ("NewPortMappingDescription", params.description.clone()),
                ("NewLeaseDuration", params.lease_duration.to_string()),
            ],
            Action::DeletePortMapping(params) | Action::GetSpecificPortMappingEntry(params) => vec![
                ("NewRemoteHost", remote_host(params.remote_host)),
                ("NewExternalPort", params.external_port.to_string()),
                ("NewProtocol", params.protocol.to_string()),
            ],
            Action::GetGenericPortMappingEntry { index } => {
                vec![("NewPortMappingIndex", index.to_string())]
            }
        }
    }
}

fn remote_host(host: Option<IpAddr>) -> String {
    host.map(|ip| ip.to_string()).unwrap_or_default()
}

/// Arguments of `AddPortMapping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPortMappingParams {
    /// `None` is the wildcard: any remote host.
    pub remote_host: Option<IpAddr>,
    pub external_port: u16,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub internal_client: IpAddr,
    pub enabled: bool,
    pub description: String,
    pub lease_duration: u32,
}

impl AddPortMappingParams {
    /// Arguments for `mapping`, forwarding to `internal_client` unless the
    /// mapping names its own private address.
    pub fn from_mapping(mapping: &Mapping, internal_client: IpAddr) -> Self {
        AddPortMappingParams {
            remote_host: mapping.public_ip(),
            external_port: mapping.public_port(),
            protocol: mapping.protocol(),
            internal_port: mapping.private_port(),
            internal_client: mapping.private_ip().unwrap_or(internal_client),
            enabled: true,
            description: mapping.description().to_string(),
            lease_duration: mapping.lifetime(),
        }
    }
}

/// Arguments identifying one entry: remote host, external port and protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingParams {
    pub remote_host: Option<IpAddr>,
    pub external_port: u16,
    pub protocol: Protocol,
}

impl PortMappingParams {
    pub fn new(protocol: Protocol, external_port: u16) -> Self {
        PortMappingParams {
            remote_host: None,
            external_port,
            protocol,
        }
    }

    pub fn from_mapping(mapping: &Mapping) -> Self {
        PortMappingParams {
            remote_host: mapping.public_ip(),
            external_port: mapping.public_port(),
            protocol: mapping.protocol(),
        }
    }
}

/// Decode a `GetGenericPortMappingEntry` response.
pub fn decode_generic_entry(response: &SoapResponse) -> Result<Mapping> {
    let protocol = response.require("NewProtocol")?.to_string();
    let external_port: i64 = response.parse("NewExternalPort")?;
    decode_entry(response, &protocol, external_port)
}

/// Decode a `GetSpecificPortMappingEntry` response. The response does not
/// repeat the external port or protocol, so they come from the request.
pub fn decode_specific_entry(response: &SoapResponse, request: &PortMappingParams) -> Result<Mapping> {
    let mut mapping = decode_entry(
        response,
        request.protocol.as_str(),
        request.external_port.into(),
    )?;
    if let Some(host) = request.remote_host {
        mapping = mapping.with_public_ip(host);
    }
    Ok(mapping)
}

fn decode_entry(response: &SoapResponse, protocol: &str, external_port: i64) -> Result<Mapping> {
    let internal_port: i64 = response.parse("NewInternalPort")?;
    let lease: i64 = match response.get("NewLeaseDuration") {
        Some(value) if !value.trim().is_empty() => response.parse("NewLeaseDuration")?,
        _ => 0,
    };
    let description = response.get("NewPortMappingDescription").unwrap_or_default();

    let mut mapping = Mapping::from_raw(protocol, internal_port, external_port, lease, description)?;

    if let Some(Ok(client)) = response.get("NewInternalClient").map(|c| c.trim().parse::<IpAddr>()) {
        mapping = mapping.with_private_ip(client);
    }
    if let Some(Ok(host)) = response.get("NewRemoteHost").map(|h| h.trim().parse::<IpAddr>()) {
        mapping = mapping.with_public_ip(host);
    }
    Ok(mapping)
}
