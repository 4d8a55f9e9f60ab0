// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Minimal SNMPv1 GET client over UDP.
//
// Printers expose consumable levels and page counters through the Printer
// MIB (RFC 3805). Only GetRequest/GetResponse is needed, so rather than pull
// in a full SNMP stack this module carries a small BER codec for exactly that
// subset.
//
// # Wire format
//
// ```text
// Message      ::= SEQUENCE { version INTEGER(0), community OCTET STRING, pdu }
// GetRequest   ::= [0] IMPLICIT SEQUENCE { request-id, error-status,
//                                          error-index, varbind-list }
// GetResponse  ::= [2] IMPLICIT SEQUENCE { ... same shape ... }
// VarBind      ::= SEQUENCE { name OBJECT IDENTIFIER, value ANY }
// ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

use printwatch_core::error::{PrintwatchError, Result};

// ---------------------------------------------------------------------------
// Transport defaults
// ---------------------------------------------------------------------------

/// Standard SNMP agent port.
pub const SNMP_PORT: u16 = 161;

/// Read-only community most printers ship with.
pub const DEFAULT_COMMUNITY: &str = "public";

/// Largest datagram we expect back.
const MAX_DATAGRAM: usize = 65_507;

/// How many times a request is repeated when the device stays silent.
const DEFAULT_RETRIES: u32 = 1;

// ---------------------------------------------------------------------------
// BER universal tags
// ---------------------------------------------------------------------------

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

// ---------------------------------------------------------------------------
// SNMP application / context tags
// ---------------------------------------------------------------------------

const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

const PDU_GET_REQUEST: u8 = 0xA0;
const PDU_GET_RESPONSE: u8 = 0xA2;

/// SNMPv1 version number on the wire.
const VERSION_1: i64 = 0;

/// error-status value for "an OID in the request does not exist".
const ERROR_NO_SUCH_NAME: i64 = 2;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A decoded variable-binding value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(String),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    /// Any tag this codec does not model.
    Other(u8),
}

impl SnmpValue {
    /// Non-negative numeric value, if this is a number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(v) => u64::try_from(*v).ok(),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => Some(u64::from(*v)),
            Self::Counter64(v) => Some(*v),
            _ => None,
        }
    }

    /// Text rendering of string values (lossy UTF-8).
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::OctetString(bytes) => Some(String::from_utf8_lossy(bytes).trim().to_string()),
            _ => None,
        }
    }

    /// Whether the agent reported the OID as absent.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::NoSuchObject | Self::NoSuchInstance | Self::EndOfMibView
        )
    }
}

/// One OID and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: String,
    pub value: SnmpValue,
}

/// A decoded SNMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpMessage {
    pub community: String,
    pub pdu_type: u8,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<VarBind>,
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encode a GetRequest for the given OIDs.
pub fn encode_get_request(
    community: &str,
    request_id: i32,
    oids: &[&str],
) -> std::result::Result<Vec<u8>, String> {
    let bindings: Vec<(&str, SnmpValue)> = oids.iter().map(|o| (*o, SnmpValue::Null)).collect();
    encode_message(community, PDU_GET_REQUEST, request_id, 0, 0, &bindings)
}

/// Encode a complete SNMPv1 message.
pub fn encode_message(
    community: &str,
    pdu_type: u8,
    request_id: i32,
    error_status: i64,
    error_index: i64,
    bindings: &[(&str, SnmpValue)],
) -> std::result::Result<Vec<u8>, String> {
    let mut varbind_list = Vec::new();
    for (oid, value) in bindings {
        let mut bind = Vec::new();
        push_tlv(&mut bind, TAG_OBJECT_ID, &encode_oid(oid)?);
        encode_value(&mut bind, value)?;
        push_tlv(&mut varbind_list, TAG_SEQUENCE, &bind);
    }

    let mut pdu = Vec::new();
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(i64::from(request_id)));
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(error_status));
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(error_index));
    push_tlv(&mut pdu, TAG_SEQUENCE, &varbind_list);

    let mut message = Vec::new();
    push_tlv(&mut message, TAG_INTEGER, &encode_integer(VERSION_1));
    push_tlv(&mut message, TAG_OCTET_STRING, community.as_bytes());
    push_tlv(&mut message, pdu_type, &pdu);

    let mut out = Vec::with_capacity(message.len() + 4);
    push_tlv(&mut out, TAG_SEQUENCE, &message);
    Ok(out)
}

fn encode_value(out: &mut Vec<u8>, value: &SnmpValue) -> std::result::Result<(), String> {
    match value {
        SnmpValue::Integer(v) => push_tlv(out, TAG_INTEGER, &encode_integer(*v)),
        SnmpValue::OctetString(bytes) => push_tlv(out, TAG_OCTET_STRING, bytes),
        SnmpValue::Null => push_tlv(out, TAG_NULL, &[]),
        SnmpValue::ObjectId(oid) => push_tlv(out, TAG_OBJECT_ID, &encode_oid(oid)?),
        SnmpValue::IpAddress(octets) => push_tlv(out, TAG_IP_ADDRESS, octets),
        SnmpValue::Counter32(v) => push_tlv(out, TAG_COUNTER32, &encode_unsigned(u64::from(*v))),
        SnmpValue::Gauge32(v) => push_tlv(out, TAG_GAUGE32, &encode_unsigned(u64::from(*v))),
        SnmpValue::TimeTicks(v) => push_tlv(out, TAG_TIMETICKS, &encode_unsigned(u64::from(*v))),
        SnmpValue::Counter64(v) => push_tlv(out, TAG_COUNTER64, &encode_unsigned(*v)),
        SnmpValue::NoSuchObject => push_tlv(out, TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => push_tlv(out, TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => push_tlv(out, TAG_END_OF_MIB_VIEW, &[]),
        SnmpValue::Other(tag) => return Err(format!("cannot encode opaque tag 0x{tag:02x}")),
    }
    Ok(())
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    push_length(out, content.len());
    out.extend_from_slice(content);
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

/// Minimal two's-complement big-endian encoding.
fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant_zero = bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0;
        let redundant_ones = bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0;
        if redundant_zero || redundant_ones {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn encode_unsigned(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let mut out = bytes[start..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

fn encode_oid(dotted: &str) -> std::result::Result<Vec<u8>, String> {
    let arcs: Vec<u64> = dotted
        .trim_start_matches('.')
        .split('.')
        .map(|arc| arc.parse::<u64>().map_err(|_| format!("bad OID arc {arc:?} in {dotted}")))
        .collect::<std::result::Result<_, _>>()?;

    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(format!("OID {dotted} is not encodable"));
    }

    let mut out = Vec::new();
    push_base128(&mut out, arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push_base128(&mut out, *arc);
    }
    Ok(out)
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut chunk = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        chunk.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    chunk.reverse();
    out.extend_from_slice(&chunk);
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Cursor over a BER-encoded buffer.
struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_byte(&mut self) -> std::result::Result<u8, String> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| format!("unexpected end of data at offset {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_length(&mut self) -> std::result::Result<usize, String> {
        let first = self.read_byte()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 2 {
            return Err(format!("unsupported BER length form 0x{first:02x}"));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(self.read_byte()?);
        }
        Ok(len)
    }

    /// Read one TLV, returning its tag and content.
    fn read_tlv(&mut self) -> std::result::Result<(u8, &'a [u8]), String> {
        let tag = self.read_byte()?;
        let len = self.read_length()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                format!(
                    "element 0x{tag:02x} claims {len} bytes, only {} left",
                    self.data.len() - self.pos
                )
            })?;
        let content = &self.data[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn expect(&mut self, expected: u8) -> std::result::Result<&'a [u8], String> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            return Err(format!("expected tag 0x{expected:02x}, found 0x{tag:02x}"));
        }
        Ok(content)
    }
}

/// Decode a complete SNMPv1 message (request or response).
pub fn decode_message(data: &[u8]) -> std::result::Result<SnmpMessage, String> {
    let mut outer = BerReader::new(data);
    let message = outer.expect(TAG_SEQUENCE)?;

    let mut reader = BerReader::new(message);
    let version = decode_integer(reader.expect(TAG_INTEGER)?)?;
    if version != VERSION_1 {
        return Err(format!("unsupported SNMP version {version}"));
    }
    let community = String::from_utf8_lossy(reader.expect(TAG_OCTET_STRING)?).into_owned();

    let (pdu_type, pdu) = reader.read_tlv()?;
    let mut pdu_reader = BerReader::new(pdu);
    let request_id = decode_integer(pdu_reader.expect(TAG_INTEGER)?)?;
    let request_id =
        i32::try_from(request_id).map_err(|_| format!("request-id {request_id} out of range"))?;
    let error_status = decode_integer(pdu_reader.expect(TAG_INTEGER)?)?;
    let error_index = decode_integer(pdu_reader.expect(TAG_INTEGER)?)?;

    let mut list = BerReader::new(pdu_reader.expect(TAG_SEQUENCE)?);
    let mut varbinds = Vec::new();
    while !list.is_empty() {
        let mut bind = BerReader::new(list.expect(TAG_SEQUENCE)?);
        let oid = decode_oid(bind.expect(TAG_OBJECT_ID)?)?;
        let (tag, content) = bind.read_tlv()?;
        varbinds.push(VarBind {
            oid,
            value: decode_value(tag, content)?,
        });
    }

    Ok(SnmpMessage {
        community,
        pdu_type,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

fn decode_value(tag: u8, content: &[u8]) -> std::result::Result<SnmpValue, String> {
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OBJECT_ID => SnmpValue::ObjectId(decode_oid(content)?),
        TAG_IP_ADDRESS => {
            let octets: [u8; 4] = content
                .try_into()
                .map_err(|_| format!("IpAddress must be 4 bytes, got {}", content.len()))?;
            SnmpValue::IpAddress(octets)
        }
        TAG_COUNTER32 => SnmpValue::Counter32(decode_u32(content)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_u32(content)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(decode_u32(content)?),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => SnmpValue::Other(other),
    })
}

fn decode_integer(content: &[u8]) -> std::result::Result<i64, String> {
    if content.is_empty() || content.len() > 8 {
        return Err(format!("INTEGER of {} bytes", content.len()));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for b in content {
        value = (value << 8) | i64::from(*b);
    }
    Ok(value)
}

fn decode_unsigned(content: &[u8]) -> std::result::Result<u64, String> {
    let trimmed = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if trimmed.is_empty() || trimmed.len() > 8 {
        return Err(format!("unsigned value of {} bytes", content.len()));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_u32(content: &[u8]) -> std::result::Result<u32, String> {
    let value = decode_unsigned(content)?;
    u32::try_from(value).map_err(|_| format!("value {value} exceeds 32 bits"))
}

fn decode_oid(content: &[u8]) -> std::result::Result<String, String> {
    let mut arcs: Vec<u64> = Vec::new();
    let mut current: u64 = 0;
    for (i, b) in content.iter().enumerate() {
        if current > (u64::MAX >> 7) {
            return Err("OID arc overflow".into());
        }
        current = (current << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (current / 40).min(2);
                arcs.push(first);
                arcs.push(current - first * 40);
            } else {
                arcs.push(current);
            }
            current = 0;
        } else if i == content.len() - 1 {
            return Err("OID ends inside an arc".into());
        }
    }
    if arcs.is_empty() {
        return Err("empty OID".into());
    }
    Ok(arcs
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join("."))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Async SNMPv1 GET client.
pub struct SnmpClient {
    community: String,
    port: u16,
    retries: u32,
    next_request_id: AtomicI32,
}

impl Default for SnmpClient {
    fn default() -> Self {
        Self::new(DEFAULT_COMMUNITY)
    }
}

impl SnmpClient {
    pub fn new(community: &str) -> Self {
        // Seed from the pid so two agents on one host do not share ids.
        let seed = (std::process::id() as i32 & 0x0FFF) << 16;
        Self {
            community: community.to_string(),
            port: SNMP_PORT,
            retries: DEFAULT_RETRIES,
            next_request_id: AtomicI32::new(seed.max(1)),
        }
    }

    /// Override the agent port (tests use an ephemeral one).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn request_id(&self) -> i32 {
        self.next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_abs()
            .max(1)
    }

    /// GET the given OIDs. The whole operation is bounded by `timeout`.
    ///
    /// SNMPv1 rejects a whole request when a single OID is unknown. Such OIDs
    /// are reported as `NoSuchObject` and the rest are asked again.
    #[instrument(skip(self, oids), fields(oid_count = oids.len()))]
    pub async fn get(&self, address: &str, oids: &[&str], timeout: Duration) -> Result<Vec<VarBind>> {
        let target = resolve_target(address, self.port).await?;
        tokio::time::timeout(timeout, self.get_inner(target, oids, timeout))
            .await
            .map_err(|_| {
                PrintwatchError::ProtocolUnreachable(format!(
                    "{address}: no SNMP response within {}ms",
                    timeout.as_millis()
                ))
            })?
    }

    async fn get_inner(&self, target: SocketAddr, oids: &[&str], timeout: Duration) -> Result<Vec<VarBind>> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        let per_attempt = timeout / (self.retries + 1);
        let mut pending: Vec<&str> = oids.to_vec();

        while !pending.is_empty() {
            let response = self.exchange(&socket, &pending, per_attempt).await?;

            if response.error_status == ERROR_NO_SUCH_NAME && response.error_index > 0 {
                let idx = (response.error_index - 1) as usize;
                if idx < pending.len() {
                    debug!(oid = pending[idx], "OID not implemented by device");
                    pending.remove(idx);
                    continue;
                }
            }
            if response.error_status != 0 {
                return Err(PrintwatchError::ProtocolUnreachable(format!(
                    "{target}: SNMP error-status {} at index {}",
                    response.error_status, response.error_index
                )));
            }

            return Ok(oids
                .iter()
                .map(|oid| {
                    let value = response
                        .varbinds
                        .iter()
                        .find(|vb| vb.oid == *oid)
                        .map(|vb| vb.value.clone())
                        .unwrap_or(SnmpValue::NoSuchObject);
                    VarBind {
                        oid: oid.to_string(),
                        value,
                    }
                })
                .collect());
        }

        // Every OID was rejected.
        Ok(oids
            .iter()
            .map(|oid| VarBind {
                oid: oid.to_string(),
                value: SnmpValue::NoSuchObject,
            })
            .collect())
    }

    /// One request/response exchange with retries on silence.
    async fn exchange(&self, socket: &UdpSocket, oids: &[&str], per_attempt: Duration) -> Result<SnmpMessage> {
        let request_id = self.request_id();
        let request = encode_get_request(&self.community, request_id, oids)
            .map_err(PrintwatchError::MalformedData)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 0..=self.retries {
            socket.send(&request).await?;
            let deadline = tokio::time::Instant::now() + per_attempt;

            loop {
                let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await;
                let len = match received {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => break,
                };
                match decode_message(&buf[..len]) {
                    Ok(msg) if msg.pdu_type == PDU_GET_RESPONSE && msg.request_id == request_id => {
                        return Ok(msg);
                    }
                    Ok(msg) => {
                        debug!(request_id = msg.request_id, "ignoring stray SNMP datagram");
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable SNMP datagram");
                    }
                }
            }
            debug!(attempt, "SNMP request timed out, retrying");
        }

        Err(PrintwatchError::ProtocolUnreachable(format!(
            "no SNMP response after {} attempts",
            self.retries + 1
        )))
    }
}

/// Turn an address literal or hostname into a socket address.
///
/// IPv6 zone suffixes (`fe80::1%10`) are dropped; the OS routing table
/// picks the interface.
async fn resolve_target(address: &str, port: u16) -> Result<SocketAddr> {
    let host = address.trim().trim_start_matches('[').trim_end_matches(']');
    let host = host.split('%').next().unwrap_or(host);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| PrintwatchError::ProtocolUnreachable(format!("resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| PrintwatchError::ProtocolUnreachable(format!("{host} has no address")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
