//! SSDP search requests and responses.

use std::net::SocketAddr;

/// Search target put in M-SEARCH requests.
pub const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Service types accepted from a search response, in order of preference.
///
/// Some routers advertise the device type where the service type belongs, so
/// `InternetGatewayDevice:1` is accepted under the service prefix too.
pub const SERVICE_TYPES: [&str; 5] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:2",
    "urn:schemas-upnp-org:service:InternetGatewayDevice:1",
];

/// Build an M-SEARCH request addressed to `target`.
pub fn encode_search_request(target: SocketAddr) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {}\r\n\
         \r\n",
        target, SEARCH_TARGET
    )
}

/// The parts of a search response a searcher acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Recognized service type the response advertised.
    pub service_type: &'static str,
    /// Device description URL from the `Location` header.
    pub location: String,
}

/// Parse a search response.
///
/// Returns `None` unless the response advertises a recognized service type
/// and carries a `Location` header. The service type is matched anywhere in
/// the text, case-insensitively, since routers vary in header casing and
/// ordering.
pub fn parse_search_response(response: &str) -> Option<SearchResponse> {
    let service_type = find_service_type(response)?;
    let location = extract_header(response, "LOCATION").filter(|l| !l.is_empty())?;
    Some(SearchResponse {
        service_type,
        location,
    })
}

/// First recognized service type mentioned in `text`.
pub fn find_service_type(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    SERVICE_TYPES
        .iter()
        .find(|urn| lower.contains(&urn.to_ascii_lowercase()))
        .copied()
}

/// Extract a header value, matching the name case-insensitively.
pub fn extract_header(message: &str, header: &str) -> Option<String> {
    message.lines().find_map(|line| {
        let (name, value) = line.trim().split_once(':')?;
        if !name.trim().eq_ignore_ascii_case(header) {
            return None;
        }
        // Remove surrounding quotes if present
        Some(value.trim().trim_matches('"').to_string())
    })
}
