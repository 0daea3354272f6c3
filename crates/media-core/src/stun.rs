//! STUN binding message codec
//!
//! Just enough of RFC 5389 for NAT traversal on the media path: binding
//! requests (plain, or protected with ICE short-term credentials), binding
//! success responses, and XOR-MAPPED-ADDRESS. Anything beyond binding is
//! the WebRTC engine's problem.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::{Error, Result};
use crate::packet::STUN_MAGIC_COOKIE;

/// STUN method/class for a binding request
pub const BINDING_REQUEST: u16 = 0x0001;
/// STUN method/class for a binding success response
pub const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const HEADER_LEN: usize = 20;
const INTEGRITY_ATTR_LEN: usize = 4 + 20;

/// 96-bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    /// Generate a fresh random transaction id
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }
}

/// A decoded STUN message, reduced to the fields this stack uses
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Combined method and class (e.g. [`BINDING_REQUEST`])
    pub message_type: u16,
    /// Transaction id echoed between request and response
    pub transaction_id: TransactionId,
    /// XOR-MAPPED-ADDRESS, when present
    pub mapped_address: Option<SocketAddr>,
}

impl StunMessage {
    pub fn is_binding_request(&self) -> bool {
        self.message_type == BINDING_REQUEST
    }

    pub fn is_binding_success(&self) -> bool {
        self.message_type == BINDING_SUCCESS
    }
}

fn push_header(buf: &mut Vec<u8>, message_type: u16, transaction_id: &TransactionId) {
    buf.extend_from_slice(&message_type.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // length, patched later
    buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(&transaction_id.0);
}

fn patch_length(buf: &mut [u8]) {
    let len = (buf.len() - HEADER_LEN) as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn push_attribute(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    // Attributes are padded to 32-bit boundaries
    let pad = (4 - value.len() % 4) % 4;
    buf.extend_from_slice(&[0u8; 3][..pad]);
}

/// Build a bare binding request, used for fire-and-forget NAT keepalive
pub fn binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    push_header(&mut buf, BINDING_REQUEST, transaction_id);
    patch_length(&mut buf);
    buf
}

/// Build a binding request protected by ICE short-term credentials.
///
/// `username` is the already-joined `remote-ufrag:local-ufrag` pair and
/// `password` the remote's ice-pwd. The MESSAGE-INTEGRITY HMAC covers the
/// message with its length field pre-adjusted to include the integrity
/// attribute itself, as RFC 5389 §15.4 requires.
pub fn binding_request_with_integrity(
    transaction_id: &TransactionId,
    username: &str,
    password: &str,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 64);
    push_header(&mut buf, BINDING_REQUEST, transaction_id);
    push_attribute(&mut buf, ATTR_USERNAME, username.as_bytes());

    let hmac_len = (buf.len() - HEADER_LEN + INTEGRITY_ATTR_LEN) as u16;
    buf[2..4].copy_from_slice(&hmac_len.to_be_bytes());
    let mut mac = Hmac::<Sha1>::new_from_slice(password.as_bytes())
        .map_err(|e| Error::MalformedStun(format!("bad integrity key: {e}")))?;
    mac.update(&buf);
    let digest = mac.finalize().into_bytes();

    push_attribute(&mut buf, ATTR_MESSAGE_INTEGRITY, &digest);
    patch_length(&mut buf);
    Ok(buf)
}

/// Build a binding success response reporting `source` as the reflexive
/// address, XOR-encoded against the magic cookie and transaction id.
pub fn binding_success_response(transaction_id: &TransactionId, source: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 12);
    push_header(&mut buf, BINDING_SUCCESS, transaction_id);

    let xport = source.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match source.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&xport.to_be_bytes());
            let xored = u32::from(ip) ^ STUN_MAGIC_COOKIE;
            value.extend_from_slice(&xored.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&xport.to_be_bytes());
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(&transaction_id.0);
            let octets = ip.octets();
            for (i, b) in mask.iter().enumerate() {
                value.push(octets[i] ^ b);
            }
        }
    }
    push_attribute(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &value);
    patch_length(&mut buf);
    buf
}

/// Parse a STUN message, extracting XOR-MAPPED-ADDRESS if present
pub fn parse(buf: &[u8]) -> Result<StunMessage> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedStun("shorter than header".into()));
    }
    if buf[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() {
        return Err(Error::MalformedStun("missing magic cookie".into()));
    }
    let message_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < HEADER_LEN + length {
        return Err(Error::MalformedStun("truncated attributes".into()));
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);
    let transaction_id = TransactionId(transaction_id);

    let mut mapped_address = None;
    let mut offset = HEADER_LEN;
    let end = HEADER_LEN + length;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        if value_start + attr_len > end {
            return Err(Error::MalformedStun("attribute overruns message".into()));
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            mapped_address = Some(decode_xor_mapped_address(
                &buf[value_start..value_start + attr_len],
                &transaction_id,
            )?);
        }
        offset = value_start + attr_len + (4 - attr_len % 4) % 4;
    }

    Ok(StunMessage {
        message_type,
        transaction_id,
        mapped_address,
    })
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::MalformedStun("short XOR-MAPPED-ADDRESS".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    match family {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let ip = Ipv4Addr::from(raw ^ STUN_MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::MalformedStun("short IPv6 XOR-MAPPED-ADDRESS".into()));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(&transaction_id.0);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::MalformedStun(format!("unknown address family {other}"))),
    }
}

/// Answer an inbound binding request with the XOR-mapped response derived
/// from the request's observed source. Returns `None` for non-requests.
pub fn respond_to_binding(buf: &[u8], source: SocketAddr) -> Option<Vec<u8>> {
    let message = parse(buf).ok()?;
    if !message.is_binding_request() {
        return None;
    }
    Some(binding_success_response(&message.transaction_id, source))
}
