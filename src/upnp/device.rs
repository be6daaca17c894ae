//! A gateway controlled through its UPnP WAN connection service.

use super::action::{
    decode_generic_entry, decode_specific_entry, Action, AddPortMappingParams, PortMappingParams,
};
use super::description::{host_endpoint, resolve_control_url};
use super::soap::{codes, SoapClient, SoapResponse};
use crate::device::DeviceState;
use crate::error::{Error, Result};
use crate::mapping::{Mapping, Protocol};
use reqwest::Url;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One entry per possible external port and protocol.
const MAX_LISTED_ENTRIES: u32 = 2 * (u16::MAX as u32 + 1);

/// Change made to a rejected `AddPortMapping` request before the one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correction {
    PermanentLease,
    SamePorts,
    WildcardRemoteHost,
}

impl Correction {
    fn for_code(code: u16) -> Option<Self> {
        match code {
            codes::ONLY_PERMANENT_LEASES_SUPPORTED => Some(Correction::PermanentLease),
            codes::SAME_PORT_VALUES_REQUIRED => Some(Correction::SamePorts),
            codes::REMOTE_HOST_ONLY_SUPPORTS_WILDCARD => Some(Correction::WildcardRemoteHost),
            _ => None,
        }
    }

    fn apply(self, mapping: &mut Mapping) {
        match self {
            Correction::PermanentLease => mapping.set_lifetime(0),
            Correction::SamePorts => mapping.set_public_port(mapping.private_port()),
            Correction::WildcardRemoteHost => mapping.clear_public_ip(),
        }
    }
}

/// A UPnP Internet Gateway Device.
#[derive(Debug)]
pub struct UpnpNatDevice {
    local_address: IpAddr,
    host: SocketAddr,
    description_url: Url,
    soap: SoapClient,
    pub(crate) state: DeviceState,
}

impl UpnpNatDevice {
    /// Build a device from its description URL and the `controlURL` of the
    /// service it advertised.
    pub fn new(
        http: reqwest::Client,
        local_address: IpAddr,
        description_url: Url,
        control_url: &str,
        service_type: impl Into<String>,
    ) -> Result<Self> {
        let control_url = resolve_control_url(&description_url, control_url)?;
        let host = host_endpoint(&control_url)?;
        Ok(UpnpNatDevice {
            local_address,
            host,
            description_url,
            soap: SoapClient::new(http, control_url, service_type),
            state: DeviceState::new(),
        })
    }

    /// Local address the device was discovered from. Used as the internal
    /// client of mappings that do not name one.
    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// Host and port control requests go to.
    pub fn host_endpoint(&self) -> SocketAddr {
        self.host
    }

    pub fn description_url(&self) -> &Url {
        &self.description_url
    }

    pub fn control_url(&self) -> &Url {
        self.soap.control_url()
    }

    pub fn service_type(&self) -> &str {
        self.soap.service_type()
    }

    async fn invoke(&self, action: &Action) -> Result<SoapResponse> {
        self.soap.invoke(action.name(), &action.args()).await
    }

    pub async fn external_ip(&self) -> Result<IpAddr> {
        let response = self.invoke(&Action::GetExternalIPAddress).await?;
        response.parse("NewExternalIPAddress")
    }

    /// Add a mapping. Returns the mapping as the router accepted it.
    ///
    /// Routers that reject the request with 724, 725 or 726 get one retry with
    /// equal ports, a permanent lease or a wildcard remote host respectively.
    pub async fn create_port_map(&self, mapping: &Mapping) -> Result<Mapping> {
        let mut mapping = mapping.clone();
        let err = match self.add_port_mapping(&mapping).await {
            Ok(()) => return Ok(mapping),
            Err(err) => err,
        };

        let Some(correction) = err.upnp_code().and_then(Correction::for_code) else {
            return Err(err);
        };
        tracing::warn!(
            "{} rejected {}: {}. Retrying with {:?}",
            self.host,
            mapping,
            err,
            correction
        );
        correction.apply(&mut mapping);
        self.add_port_mapping(&mapping).await?;
        Ok(mapping)
    }

    async fn add_port_mapping(&self, mapping: &Mapping) -> Result<()> {
        let params = AddPortMappingParams::from_mapping(mapping, self.local_address);
        self.invoke(&Action::AddPortMapping(params)).await?;
        Ok(())
    }

    pub async fn delete_port_map(&self, mapping: &Mapping) -> Result<()> {
        let params = PortMappingParams::from_mapping(mapping);
        self.invoke(&Action::DeletePortMapping(params)).await?;
        Ok(())
    }

    /// Every entry of the router's mapping table, in index order.
    pub async fn get_all_mappings(&self) -> Result<Vec<Mapping>> {
        self.list_mappings(MAX_LISTED_ENTRIES).await
    }

    /// Read entries until the router answers 713. A table that does not end
    /// within `limit` entries is an invalid response.
    async fn list_mappings(&self, limit: u32) -> Result<Vec<Mapping>> {
        let mut mappings = Vec::new();
        for index in 0..limit {
            let action = Action::GetGenericPortMappingEntry { index };
            match self.invoke(&action).await {
                Ok(response) => mappings.push(decode_generic_entry(&response)?),
                Err(Error::Upnp { code: codes::SPECIFIED_ARRAY_INDEX_INVALID, .. }) => {
                    return Ok(mappings)
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::InvalidResponse(format!(
            "{} listed more than {} port mappings",
            self.host, limit
        )))
    }

    /// The entry for `public_port`, or `None` if the router has none.
    pub async fn get_specific_mapping(
        &self,
        protocol: Protocol,
        public_port: u16,
    ) -> Result<Option<Mapping>> {
        let params = PortMappingParams::new(protocol, public_port);
        match self
            .invoke(&Action::GetSpecificPortMappingEntry(params.clone()))
            .await
        {
            Ok(response) => decode_specific_entry(&response, &params).map(Some),
            Err(Error::Upnp { code: codes::NO_SUCH_ENTRY_IN_ARRAY, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for UpnpNatDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UPnP device {} (control {}, description {}, service {})",
            self.host,
            self.soap.control_url(),
            self.description_url,
            self.soap.service_type()
        )
    }
}
