//! Loopback gateways for integration tests: a UPnP IGD served over HTTP, an
//! SSDP responder and a NAT-PMP gateway.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use nat_mapper::net::SocketSet;
use nat_mapper::{DiscoveryConfig, NatDevice, Searcher, UpnpSearcher};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const WAN_COMMON_INTERFACE_CONFIG: &str =
    "urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const SOAP_ENVELOPE_START: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>"#;

const SOAP_ENVELOPE_END: &str = r#"</s:Body>
</s:Envelope>"#;

// =============================================================================
// UPnP IGD
// =============================================================================

/// A row of the mock router's port mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub remote_host: String,
    pub external_port: u16,
    pub protocol: String,
    pub internal_port: u16,
    pub internal_client: String,
    pub description: String,
    pub lease_duration: u32,
}

impl Entry {
    pub fn new(protocol: &str, external_port: u16, internal_port: u16, internal_client: &str) -> Self {
        Entry {
            remote_host: String::new(),
            external_port,
            protocol: protocol.to_string(),
            internal_port,
            internal_client: internal_client.to_string(),
            description: "test".to_string(),
            lease_duration: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedSoapRequest {
    pub action: String,
    pub body: String,
}

struct IgdState {
    service_type: String,
    external_ip: Ipv4Addr,
    permanent_only: bool,
    delay: Option<Duration>,
    table: Mutex<Vec<Entry>>,
    faults: Mutex<VecDeque<(String, u16)>>,
    requests: Mutex<Vec<ReceivedSoapRequest>>,
    description_fetches: AtomicUsize,
}

/// Builder for [`MockIgd`].
pub struct MockIgdBuilder {
    service_type: String,
    external_ip: Ipv4Addr,
    permanent_only: bool,
    delay: Option<Duration>,
}

impl MockIgdBuilder {
    /// Service type listed for the control URL in the description.
    pub fn service_type(mut self, service_type: &str) -> Self {
        self.service_type = service_type.to_string();
        self
    }

    pub fn external_ip(mut self, ip: Ipv4Addr) -> Self {
        self.external_ip = ip;
        self
    }

    /// Reject leased mappings with 725, like many consumer routers.
    pub fn permanent_only(mut self) -> Self {
        self.permanent_only = true;
        self
    }

    /// Hold every SOAP response for `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn start(self) -> MockIgd {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(IgdState {
            service_type: self.service_type,
            external_ip: self.external_ip,
            permanent_only: self.permanent_only,
            delay: self.delay,
            table: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            description_fetches: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/rootDesc.xml", get(handle_root_desc))
            .route("/ctl/IPConn", post(handle_soap_action))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        MockIgd {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

/// An Internet Gateway Device with a working port mapping table.
pub struct MockIgd {
    addr: SocketAddr,
    state: Arc<IgdState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockIgd {
    pub fn builder() -> MockIgdBuilder {
        MockIgdBuilder {
            service_type: WAN_IP_CONNECTION.to_string(),
            external_ip: Ipv4Addr::new(203, 0, 113, 7),
            permanent_only: false,
            delay: None,
        }
    }

    pub async fn start() -> Self {
        MockIgd::builder().start().await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn description_url(&self) -> String {
        format!("http://{}/rootDesc.xml", self.addr)
    }

    pub fn description_fetches(&self) -> usize {
        self.state.description_fetches.load(Ordering::SeqCst)
    }

    pub async fn entries(&self) -> Vec<Entry> {
        self.state.table.lock().await.clone()
    }

    pub async fn insert(&self, entry: Entry) {
        self.state.table.lock().await.push(entry);
    }

    /// Answer the next `action` request with UPnP error `code`.
    pub async fn fail_next(&self, action: &str, code: u16) {
        self.state
            .faults
            .lock()
            .await
            .push_back((action.to_string(), code));
    }

    /// SOAP requests received so far, optionally only those for `action`.
    pub async fn requests(&self, action: Option<&str>) -> Vec<ReceivedSoapRequest> {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| action.map_or(true, |a| r.action == a))
            .cloned()
            .collect()
    }

    /// An SSDP search response pointing at this device.
    pub fn ssdp_response(&self, search_target: &str) -> String {
        ssdp_response(search_target, &self.description_url())
    }

    /// A UPnP device found by feeding this IGD's search response straight to
    /// a searcher.
    pub async fn discover(&self) -> NatDevice {
        let searcher =
            UpnpSearcher::with_sockets(SocketSet::default(), &DiscoveryConfig::default()).unwrap();
        searcher
            .handle(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.ssdp_response(WAN_IP_CONNECTION).as_bytes(),
                "127.0.0.1:1900".parse().unwrap(),
            )
            .await
            .expect("device should be discovered")
    }
}

impl Drop for MockIgd {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn ssdp_response(search_target: &str, location: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         ST: {}\r\n\
         USN: uuid:mock-igd-001::{}\r\n\
         EXT:\r\n\
         SERVER: mock-igd/0.1 UPnP/1.0\r\n\
         LOCATION: {}\r\n\
         \r\n",
        search_target, search_target, location
    )
}

async fn handle_root_desc(State(state): State<Arc<IgdState>>) -> Response<Body> {
    state.description_fetches.fetch_add(1, Ordering::SeqCst);
    xml_response(StatusCode::OK, generate_device_description(&state.service_type))
}

async fn handle_soap_action(
    State(state): State<Arc<IgdState>>,
    headers: HeaderMap,
    body: String,
) -> Response<Body> {
    let action = headers
        .get("SOAPACTION")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim_matches('"').split_once('#'))
        .map(|(_, action)| action.to_string())
        .unwrap_or_default();

    state.requests.lock().await.push(ReceivedSoapRequest {
        action: action.clone(),
        body: body.clone(),
    });

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    {
        let mut faults = state.faults.lock().await;
        if let Some(pos) = faults.iter().position(|(a, _)| *a == action) {
            let (_, code) = faults.remove(pos).unwrap();
            return soap_error_response(code, "Scripted failure");
        }
    }

    let value = |tag: &str| extract_xml_value(&body, tag).unwrap_or_default();
    let port = |tag: &str| value(tag).trim().parse::<u16>().unwrap_or(0);

    match action.as_str() {
        "GetExternalIPAddress" => success_response(
            &action,
            &state.service_type,
            &format!("<NewExternalIPAddress>{}</NewExternalIPAddress>", state.external_ip),
        ),
        "AddPortMapping" => {
            let entry = Entry {
                remote_host: value("NewRemoteHost"),
                external_port: port("NewExternalPort"),
                protocol: value("NewProtocol"),
                internal_port: port("NewInternalPort"),
                internal_client: value("NewInternalClient"),
                description: value("NewPortMappingDescription"),
                lease_duration: value("NewLeaseDuration").trim().parse().unwrap_or(0),
            };
            if state.permanent_only && entry.lease_duration != 0 {
                return soap_error_response(725, "OnlyPermanentLeasesSupported");
            }

            let mut table = state.table.lock().await;
            let existing = table
                .iter()
                .position(|e| e.external_port == entry.external_port && e.protocol == entry.protocol);
            match existing {
                Some(pos) if table[pos].internal_client != entry.internal_client => {
                    soap_error_response(718, "ConflictInMappingEntry")
                }
                Some(pos) => {
                    table[pos] = entry;
                    success_response(&action, &state.service_type, "")
                }
                None => {
                    table.push(entry);
                    success_response(&action, &state.service_type, "")
                }
            }
        }
        "DeletePortMapping" => {
            let external_port = port("NewExternalPort");
            let protocol = value("NewProtocol");
            let mut table = state.table.lock().await;
            match table
                .iter()
                .position(|e| e.external_port == external_port && e.protocol == protocol)
            {
                Some(pos) => {
                    table.remove(pos);
                    success_response(&action, &state.service_type, "")
                }
                None => soap_error_response(714, "NoSuchEntryInArray"),
            }
        }
        "GetGenericPortMappingEntry" => {
            let index: usize = value("NewPortMappingIndex").trim().parse().unwrap_or(usize::MAX);
            let table = state.table.lock().await;
            match table.get(index) {
                Some(entry) => {
                    success_response(&action, &state.service_type, &entry_fields(entry, true))
                }
                None => soap_error_response(713, "SpecifiedArrayIndexInvalid"),
            }
        }
        "GetSpecificPortMappingEntry" => {
            let external_port = port("NewExternalPort");
            let protocol = value("NewProtocol");
            let table = state.table.lock().await;
            match table
                .iter()
                .find(|e| e.external_port == external_port && e.protocol == protocol)
            {
                Some(entry) => {
                    success_response(&action, &state.service_type, &entry_fields(entry, false))
                }
                None => soap_error_response(714, "NoSuchEntryInArray"),
            }
        }
        _ => soap_error_response(401, "Invalid Action"),
    }
}

fn entry_fields(entry: &Entry, generic: bool) -> String {
    let mut fields = String::new();
    if generic {
        fields.push_str(&format!(
            "<NewRemoteHost>{}</NewRemoteHost>\n\
             <NewExternalPort>{}</NewExternalPort>\n\
             <NewProtocol>{}</NewProtocol>\n",
            entry.remote_host, entry.external_port, entry.protocol
        ));
    }
    fields.push_str(&format!(
        "<NewInternalPort>{}</NewInternalPort>\n\
         <NewInternalClient>{}</NewInternalClient>\n\
         <NewEnabled>1</NewEnabled>\n\
         <NewPortMappingDescription>{}</NewPortMappingDescription>\n\
         <NewLeaseDuration>{}</NewLeaseDuration>",
        entry.internal_port, entry.internal_client, entry.description, entry.lease_duration
    ));
    fields
}

fn success_response(action: &str, service_type: &str, fields: &str) -> Response<Body> {
    let body = format!(
        "{SOAP_ENVELOPE_START}\n<u:{action}Response xmlns:u=\"{service_type}\">\n{fields}\n</u:{action}Response>\n{SOAP_ENVELOPE_END}"
    );
    xml_response(StatusCode::OK, body)
}

fn soap_error_response(code: u16, description: &str) -> Response<Body> {
    let body = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>{code}</errorCode>
<errorDescription>{description}</errorDescription>
</UPnPError>
</detail>
</s:Fault>
</s:Body>
</s:Envelope>"#
    );
    xml_response(StatusCode::INTERNAL_SERVER_ERROR, body)
}

fn xml_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
        .body(Body::from(body))
        .unwrap()
}

fn extract_xml_value(body: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{}", tag);
    let end_tag = format!("</{}>", tag);

    let start = body.find(&start_tag)?;
    let after_start = &body[start..];
    let tag_end = after_start.find('>')?;
    let content_start = start + tag_end + 1;

    let end = body[content_start..].find(&end_tag)?;
    Some(body[content_start..content_start + end].to_string())
}

fn generate_device_description(service_type: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion>
    <major>1</major>
    <minor>0</minor>
  </specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Mock IGD</friendlyName>
    <manufacturer>mock-igd</manufacturer>
    <UDN>uuid:mock-igd-001</UDN>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <friendlyName>WANDevice</friendlyName>
        <UDN>uuid:mock-igd-wan-001</UDN>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <friendlyName>WANConnectionDevice</friendlyName>
            <UDN>uuid:mock-igd-wanconn-001</UDN>
            <serviceList>
              <service>
                <serviceType>{service_type}</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <SCPDURL>/WANIPCn.xml</SCPDURL>
                <controlURL>/ctl/IPConn</controlURL>
                <eventSubURL>/evt/IPConn</eventSubURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:WANCommonIFC1</serviceId>
            <SCPDURL>/WANCommonIFC1.xml</SCPDURL>
            <controlURL>/ctl/WANCommonIFC1</controlURL>
            <eventSubURL>/evt/WANCommonIFC1</eventSubURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#
    )
}

// =============================================================================
// SSDP
// =============================================================================

/// Answers every datagram it receives with a fixed search response.
pub struct SsdpResponder {
    addr: SocketAddr,
    searches: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SsdpResponder {
    pub async fn start(response: String) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let searches = Arc::new(AtomicUsize::new(0));

        let counter = searches.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                if !buf[..len].starts_with(b"M-SEARCH") {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.send_to(response.as_bytes(), src).await;
            }
        });

        SsdpResponder {
            addr,
            searches,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

impl Drop for SsdpResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A bound socket that never answers, for search targets that must stay silent.
pub async fn black_hole() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

// =============================================================================
// NAT-PMP
// =============================================================================

/// How the mock gateway answers mapping requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpMode {
    /// Grant the request, moving the public port by `port_offset` and capping
    /// the lifetime at `max_lifetime`.
    Grant { port_offset: u16, max_lifetime: u32 },
    /// Answer with a non-zero result code.
    Fail(u16),
    /// Never answer.
    Silent,
}

struct PmpState {
    external_ip: Ipv4Addr,
    mode: Mutex<PmpMode>,
    /// Send a malformed datagram before every real answer.
    noise: bool,
    address_requests: AtomicUsize,
    mapping_requests: Mutex<Vec<Vec<u8>>>,
    mapping_request_times: Mutex<Vec<Instant>>,
}

/// A NAT-PMP gateway on a loopback port.
pub struct MockPmpGateway {
    addr: SocketAddr,
    state: Arc<PmpState>,
    task: JoinHandle<()>,
}

impl MockPmpGateway {
    pub async fn start(mode: PmpMode) -> Self {
        MockPmpGateway::start_with(mode, false).await
    }

    /// Like [`MockPmpGateway::start`], but every answer is preceded by a
    /// malformed datagram.
    pub async fn start_noisy(mode: PmpMode) -> Self {
        MockPmpGateway::start_with(mode, true).await
    }

    async fn start_with(mode: PmpMode, noise: bool) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(PmpState {
            external_ip: Ipv4Addr::new(198, 51, 100, 20),
            mode: Mutex::new(mode),
            noise,
            address_requests: AtomicUsize::new(0),
            mapping_requests: Mutex::new(Vec::new()),
            mapping_request_times: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(run_pmp_gateway(socket, state.clone()));
        MockPmpGateway { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.state.external_ip
    }

    pub async fn set_mode(&self, mode: PmpMode) {
        *self.state.mode.lock().await = mode;
    }

    pub fn address_requests(&self) -> usize {
        self.state.address_requests.load(Ordering::SeqCst)
    }

    /// Raw mapping requests received so far.
    pub async fn mapping_requests(&self) -> Vec<Vec<u8>> {
        self.state.mapping_requests.lock().await.clone()
    }

    /// When each mapping request arrived.
    pub async fn mapping_request_times(&self) -> Vec<Instant> {
        self.state.mapping_request_times.lock().await.clone()
    }
}

impl Drop for MockPmpGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_pmp_gateway(socket: UdpSocket, state: Arc<PmpState>) {
    let mut buf = [0u8; 64];
    while let Ok((len, src)) = socket.recv_from(&mut buf).await {
        let request = &buf[..len];
        let response = match request {
            [0, 0] => {
                state.address_requests.fetch_add(1, Ordering::SeqCst);
                let mut response = vec![0, 128, 0, 0, 0, 0, 0, 1];
                response.extend_from_slice(&state.external_ip.octets());
                Some(response)
            }
            [0, op @ (1 | 2), ..] if len == 12 => {
                state.mapping_requests.lock().await.push(request.to_vec());
                state.mapping_request_times.lock().await.push(Instant::now());
                mapping_response(*op, request, *state.mode.lock().await)
            }
            _ => None,
        };

        if let Some(response) = response {
            if state.noise {
                let _ = socket.send_to(&[0, 128, 0], src).await;
            }
            let _ = socket.send_to(&response, src).await;
        }
    }
}

fn mapping_response(op: u8, request: &[u8], mode: PmpMode) -> Option<Vec<u8>> {
    let private_port = u16::from_be_bytes([request[4], request[5]]);
    let requested_public = u16::from_be_bytes([request[6], request[7]]);
    let requested_lifetime = u32::from_be_bytes([request[8], request[9], request[10], request[11]]);

    let (result_code, public_port, lifetime) = match mode {
        PmpMode::Silent => return None,
        PmpMode::Fail(code) => (code, 0, 0),
        PmpMode::Grant { .. } if requested_lifetime == 0 => (0, 0, 0),
        PmpMode::Grant {
            port_offset,
            max_lifetime,
        } => (
            0,
            requested_public.wrapping_add(port_offset),
            requested_lifetime.min(max_lifetime),
        ),
    };

    let mut response = vec![0, op + 128];
    response.extend_from_slice(&result_code.to_be_bytes());
    response.extend_from_slice(&1u32.to_be_bytes());
    response.extend_from_slice(&private_port.to_be_bytes());
    response.extend_from_slice(&public_port.to_be_bytes());
    response.extend_from_slice(&lifetime.to_be_bytes());
    Some(response)
}
