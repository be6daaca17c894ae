//! Device description documents (`rootDesc.xml`).

use crate::error::{Error, Result};
use reqwest::Url;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Deserialize)]
struct Root {
    device: Device,
}

/// A device and its embedded devices.
#[derive(Debug, Default, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceType", default)]
    pub device_type: String,
    #[serde(rename = "friendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "serviceList", default)]
    service_list: ServiceList,
    #[serde(rename = "deviceList", default)]
    device_list: DeviceList,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceList {
    #[serde(rename = "service", default)]
    services: Vec<Service>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceList {
    #[serde(rename = "device", default)]
    devices: Vec<Device>,
}

/// One `<service>` entry.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Service {
    #[serde(rename = "serviceType", default)]
    pub service_type: String,
    #[serde(rename = "controlURL", default)]
    pub control_url: String,
    #[serde(rename = "SCPDURL", default)]
    pub scpd_url: String,
}

impl Device {
    /// Every service of this device and its embedded devices, depth first.
    pub fn services(&self) -> Vec<&Service> {
        let mut services: Vec<&Service> = self.service_list.services.iter().collect();
        for child in &self.device_list.devices {
            services.extend(child.services());
        }
        services
    }

    /// The service whose type equals `service_type`, ignoring case.
    pub fn find_service(&self, service_type: &str) -> Option<&Service> {
        self.services()
            .into_iter()
            .find(|s| s.service_type.trim().eq_ignore_ascii_case(service_type))
    }
}

/// Parse a device description document into its root device.
pub fn parse_description(xml: &str) -> Result<Device> {
    let root: Root = quick_xml::de::from_str(xml)?;
    Ok(root.device)
}

/// Resolve a `controlURL` against the description URL.
///
/// Relative control URLs are taken from the root of the description host.
/// Absolute ones are used as they are, which can move the device to a
/// different host or port.
pub fn resolve_control_url(description_url: &Url, control_url: &str) -> Result<Url> {
    let control_url = control_url.trim();
    if let Ok(absolute) = Url::parse(control_url) {
        return Ok(absolute);
    }
    let path = format!("/{}", control_url.trim_start_matches('/'));
    description_url
        .join(&path)
        .map_err(|e| Error::InvalidResponse(format!("bad control URL {:?}: {}", control_url, e)))
}

/// Socket address of the host a URL points at.
pub fn host_endpoint(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidResponse(format!("URL without host: {}", url)))?;
    let ip: IpAddr = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| Error::InvalidResponse(format!("URL host is not an IP address: {}", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidResponse(format!("URL without port: {}", url)))?;
    Ok(SocketAddr::new(ip, port))
}
