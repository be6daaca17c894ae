//! NAT-PMP wire format (RFC 6886).

use crate::mapping::Protocol;
use std::net::Ipv4Addr;
use std::time::Duration;

/// NAT-PMP protocol version.
pub const VERSION: u8 = 0;

/// Responses carry the request opcode with this bit set.
pub const RESPONSE_FLAG: u8 = 128;

/// Result code for a successful request.
pub const RESULT_SUCCESS: u16 = 0;

pub const EXTERNAL_ADDRESS_RESPONSE_LEN: usize = 12;
pub const MAPPING_REQUEST_LEN: usize = 12;
pub const MAPPING_RESPONSE_LEN: usize = 16;

/// First wait of a probe or mapping retry sequence.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A search cycle ends once the retry delay reaches this value.
pub const CYCLE_LIMIT: Duration = Duration::from_millis(128_000);

/// Pause before a new search cycle after one went unanswered.
pub const IDLE_AFTER_FAILED_CYCLE: Duration = Duration::from_secs(10 * 60);

/// Pause before re-probing a gateway that answered.
pub const REFRESH_AFTER_SUCCESS: Duration = Duration::from_secs(5 * 60);

/// NAT-PMP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    ExternalAddress = 0,
    MapUdp = 1,
    MapTcp = 2,
}

impl Opcode {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::UDP => Opcode::MapUdp,
            Protocol::TCP => Opcode::MapTcp,
        }
    }

    /// Opcode of the matching response.
    pub fn response(self) -> u8 {
        self as u8 | RESPONSE_FLAG
    }
}

/// The 2-byte external address request sent while searching.
pub fn encode_external_address_request() -> [u8; 2] {
    [VERSION, Opcode::ExternalAddress as u8]
}

/// A decoded external address response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddressResponse {
    pub result_code: u16,
    pub epoch: u32,
    pub external_ip: Ipv4Addr,
}

/// Decode an external address response.
///
/// Returns `None` for anything that is not exactly 12 bytes with the expected
/// version and opcode.
pub fn decode_external_address_response(buf: &[u8]) -> Option<ExternalAddressResponse> {
    if buf.len() != EXTERNAL_ADDRESS_RESPONSE_LEN
        || buf[0] != VERSION
        || buf[1] != Opcode::ExternalAddress.response()
    {
        return None;
    }

    Some(ExternalAddressResponse {
        result_code: u16::from_be_bytes([buf[2], buf[3]]),
        epoch: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        external_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
    })
}

/// A port mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub private_port: u16,
    /// Suggested public port. Zero when deleting.
    pub public_port: u16,
    /// Requested lifetime in seconds. Zero when deleting.
    pub lifetime: u32,
}

impl MappingRequest {
    pub fn encode(&self) -> [u8; MAPPING_REQUEST_LEN] {
        let mut buf = [0u8; MAPPING_REQUEST_LEN];
        buf[0] = VERSION;
        buf[1] = Opcode::for_protocol(self.protocol) as u8;
        // buf[2..4] reserved
        buf[4..6].copy_from_slice(&self.private_port.to_be_bytes());
        buf[6..8].copy_from_slice(&self.public_port.to_be_bytes());
        buf[8..12].copy_from_slice(&self.lifetime.to_be_bytes());
        buf
    }

    /// Whether `response` answers this request.
    pub fn matches(&self, response: &MappingResponse) -> bool {
        response.protocol == self.protocol && response.private_port == self.private_port
    }
}

/// A decoded port mapping response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingResponse {
    pub protocol: Protocol,
    pub result_code: u16,
    pub epoch: u32,
    pub private_port: u16,
    pub public_port: u16,
    /// Granted lifetime. Zero confirms a deletion.
    pub lifetime: u32,
}

/// Decode a port mapping response.
///
/// Returns `None` for short datagrams, a wrong version or an opcode that is
/// not a mapping response.
pub fn decode_mapping_response(buf: &[u8]) -> Option<MappingResponse> {
    if buf.len() < MAPPING_RESPONSE_LEN || buf[0] != VERSION {
        return None;
    }

    let protocol = match buf[1] {
        op if op == Opcode::MapUdp.response() => Protocol::UDP,
        op if op == Opcode::MapTcp.response() => Protocol::TCP,
        _ => return None,
    };

    Some(MappingResponse {
        protocol,
        result_code: u16::from_be_bytes([buf[2], buf[3]]),
        epoch: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        private_port: u16::from_be_bytes([buf[8], buf[9]]),
        public_port: u16::from_be_bytes([buf[10], buf[11]]),
        lifetime: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
    })
}

/// What a searcher should do on its next scheduled search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Send a probe and search again after the given delay.
    Probe(Duration),
    /// The cycle went unanswered. Send nothing and search again after the given delay.
    Rest(Duration),
}

/// Probe backoff for the external address search.
///
/// The delay starts at 250 ms and doubles after each probe. When it reaches
/// 128 s the cycle is abandoned and restarts ten minutes later.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            delay: INITIAL_RETRY_DELAY,
        }
    }

    pub fn step(&mut self) -> BackoffStep {
        let wait = self.delay;
        self.delay *= 2;
        if self.delay >= CYCLE_LIMIT {
            self.reset();
            return BackoffStep::Rest(IDLE_AFTER_FAILED_CYCLE);
        }
        BackoffStep::Probe(wait)
    }

    /// Restart the sequence, e.g. after a gateway answered.
    pub fn reset(&mut self) {
        self.delay = INITIAL_RETRY_DELAY;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}
