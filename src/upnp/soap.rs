//! SOAP control requests and responses.

use crate::error::{Error, Result};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;
use std::collections::HashMap;

/// Namespace of `UPnPError` fault details.
pub const CONTROL_NS: &str = "urn:schemas-upnp-org:control-1-0";

const SOAP_ENVELOPE_START: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>"#;

const SOAP_ENVELOPE_END: &str = r#"</s:Body>
</s:Envelope>"#;

/// UPnP error codes the client acts on.
pub mod codes {
    /// `GetGenericPortMappingEntry` index past the end of the table.
    pub const SPECIFIED_ARRAY_INDEX_INVALID: u16 = 713;
    /// No mapping matches a `GetSpecificPortMappingEntry` request.
    pub const NO_SUCH_ENTRY_IN_ARRAY: u16 = 714;
    /// The mapping conflicts with one held by another client.
    pub const CONFLICT_IN_MAPPING_ENTRY: u16 = 718;
    /// Internal and external port must be equal.
    pub const SAME_PORT_VALUES_REQUIRED: u16 = 724;
    /// Only a lease duration of zero is accepted.
    pub const ONLY_PERMANENT_LEASES_SUPPORTED: u16 = 725;
    /// The remote host must be the wildcard.
    pub const REMOTE_HOST_ONLY_SUPPORTS_WILDCARD: u16 = 726;
}

/// Build the envelope for `action` with its arguments in order.
pub fn build_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut body = format!("<u:{action} xmlns:u=\"{}\">\n", escape(service_type));
    for (name, value) in args {
        body.push_str(&format!("<{name}>{}</{name}>\n", escape(value.as_str())));
    }
    body.push_str(&format!("</u:{action}>"));

    format!("{SOAP_ENVELOPE_START}\n{body}\n{SOAP_ENVELOPE_END}")
}

/// Output arguments of a successful action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoapResponse {
    fields: HashMap<String, String>,
}

impl SoapResponse {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// A field that must be present.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::InvalidResponse(format!("missing {}", name)))
    }

    /// A field parsed into `T`.
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Result<T> {
        let value = self.require(name)?;
        value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(format!("bad {}: {:?}", name, value)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Fault,
    Response,
}

/// Parse a control response body.
///
/// A `UPnPError` fault anywhere in the body becomes [`Error::Upnp`]. Otherwise
/// the children of `<{action}Response>` are returned by local name.
pub fn parse_response(body: &str, action: &str) -> Result<SoapResponse> {
    let expected = format!("{}Response", action);
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut section = Section::Outside;
    let mut saw_fault = false;
    let mut saw_response = false;
    let mut current: Option<String> = None;
    let mut fault = HashMap::new();
    let mut fields = HashMap::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "UPnPError" {
                    section = Section::Fault;
                    saw_fault = true;
                } else if name == expected {
                    section = Section::Response;
                    saw_response = true;
                } else if section != Section::Outside {
                    current = Some(name);
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match section {
                    Section::Response => {
                        fields.insert(name, String::new());
                    }
                    Section::Outside if name == expected => saw_response = true,
                    _ => {}
                }
            }
            Event::Text(text) => {
                if let Some(name) = current.as_ref() {
                    let value = text.unescape()?.into_owned();
                    match section {
                        Section::Fault => {
                            fault.insert(name.clone(), value);
                        }
                        Section::Response => {
                            fields.insert(name.clone(), value);
                        }
                        Section::Outside => {}
                    }
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "UPnPError" || name == expected {
                    section = Section::Outside;
                } else if section == Section::Response && current.as_deref() == Some(name.as_str()) {
                    // <NewRemoteHost></NewRemoteHost>
                    fields.entry(name).or_default();
                }
                current = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if saw_fault {
        let code = fault
            .get("errorCode")
            .and_then(|c| c.trim().parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidResponse("UPnPError without errorCode".into()))?;
        let description = fault.remove("errorDescription").unwrap_or_default();
        return Err(Error::Upnp { code, description });
    }

    if !saw_response {
        return Err(Error::InvalidResponse(format!("missing {}", expected)));
    }

    Ok(SoapResponse { fields })
}

/// Invokes actions on one service of a device.
#[derive(Debug, Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    control_url: Url,
    service_type: String,
}

impl SoapClient {
    pub fn new(http: reqwest::Client, control_url: Url, service_type: impl Into<String>) -> Self {
        SoapClient {
            http,
            control_url,
            service_type: service_type.into(),
        }
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// POST `action` and parse the reply.
    ///
    /// Faults are returned as [`Error::Upnp`] whatever the HTTP status.
    pub async fn invoke(&self, action: &str, args: &[(&str, String)]) -> Result<SoapResponse> {
        let envelope = build_envelope(&self.service_type, action, args);
        tracing::trace!("{} -> {}", action, self.control_url);

        let response = self
            .http
            .post(self.control_url.clone())
            .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", format!("\"{}#{}\"", self.service_type, action))
            .body(envelope)
            .send()
            .await
            .map_err(Error::from_http)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::from_http)?;

        match parse_response(&body, action) {
            Err(Error::InvalidResponse(reason)) if !status.is_success() => Err(
                Error::InvalidResponse(format!("{} failed with HTTP {}: {}", action, status, reason)),
            ),
            result => result,
        }
    }
}
