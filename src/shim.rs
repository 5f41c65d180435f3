//! In-packet shim layer: carrying a route record inside a live IPv4 packet.
//!
//! A shimmed packet holds the encoded [`RouteRecord`] immediately after
//! the IP header, with the header's protocol field replaced by the
//! reserved sentinel [`SHIM_PROTOCOL`]. The record's own protocol byte
//! preserves the original transport protocol so the destination can
//! restore the packet exactly.
//!
//! The transforms here are pure functions of (header, payload); the
//! OS-level interception mechanism that feeds raw packets in and applies
//! the resulting [`Verdict`] is an external collaborator.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::NonceAuthenticator;
use crate::protocol::ProtocolError;
use crate::record::{RouteRecord, RouterEntry};

/// Reserved IPv4 protocol number marking the presence of a route record.
pub const SHIM_PROTOCOL: u8 = 253;

/// Minimum IPv4 header size (no options).
const MIN_HEADER_LEN: usize = 20;

/// Errors from parsing or rebuilding IPv4 packets.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("packet too short for IPv4 header: {0} bytes")]
    TooShort(usize),

    #[error("not an IPv4 packet (version {0})")]
    UnsupportedVersion(u8),

    #[error("invalid IPv4 header length: {0} bytes")]
    InvalidHeaderLength(usize),

    #[error("total length field {total_length} does not match header + payload ({actual})")]
    LengthMismatch { total_length: u16, actual: usize },

    #[error("packet too large after shim: {0} bytes")]
    PacketTooLarge(usize),

    #[error("bad route record in shim payload: {0}")]
    Record(#[from] ProtocolError),
}

/// What the packet-interception collaborator should do with a packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet pass unmodified.
    Accept,
    /// Discard the packet.
    Drop,
    /// Accept the packet with replacement bytes.
    Replace(Vec<u8>),
}

/// An IPv4 header as an explicit value type.
///
/// Parsed once at the interception boundary and rebuilt on serialization;
/// shim transforms mutate the owned value instead of patching shared byte
/// buffers in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// DSCP/ECN byte (legacy TOS).
    pub dscp_ecn: u8,
    /// Total length field: header plus payload, in bytes.
    pub total_length: u16,
    pub identification: u16,
    /// Flags (3 bits) and fragment offset (13 bits).
    pub flags_fragment: u16,
    pub ttl: u8,
    /// Transport protocol number; [`SHIM_PROTOCOL`] while shimmed.
    pub protocol: u8,
    /// Checksum as parsed. Zeroed by the shim transforms and always
    /// recomputed on serialization.
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Raw options bytes, already padded to a multiple of 4.
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Header length in bytes, including options.
    pub fn header_len(&self) -> usize {
        MIN_HEADER_LEN + self.options.len()
    }

    /// Parse a header from the front of a raw packet, returning the
    /// header and the remaining payload bytes.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ShimError> {
        if bytes.len() < MIN_HEADER_LEN {
            return Err(ShimError::TooShort(bytes.len()));
        }

        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(ShimError::UnsupportedVersion(version));
        }

        let header_len = (bytes[0] & 0x0F) as usize * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(ShimError::InvalidHeaderLength(header_len));
        }
        if bytes.len() < header_len {
            return Err(ShimError::TooShort(bytes.len()));
        }

        let header = Self {
            dscp_ecn: bytes[1],
            total_length: u16::from_be_bytes([bytes[2], bytes[3]]),
            identification: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags_fragment: u16::from_be_bytes([bytes[6], bytes[7]]),
            ttl: bytes[8],
            protocol: bytes[9],
            checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
            src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
            options: bytes[MIN_HEADER_LEN..header_len].to_vec(),
        };

        Ok((header, &bytes[header_len..]))
    }

    /// Render the header bytes with the given checksum field value.
    fn to_bytes(&self, checksum: u16) -> Result<Vec<u8>, ShimError> {
        let header_len = self.header_len();
        if header_len > 60 || self.options.len() % 4 != 0 {
            return Err(ShimError::InvalidHeaderLength(header_len));
        }

        let mut buf = Vec::with_capacity(header_len);
        buf.push(0x40 | (header_len / 4) as u8);
        buf.push(self.dscp_ecn);
        buf.extend_from_slice(&self.total_length.to_be_bytes());
        buf.extend_from_slice(&self.identification.to_be_bytes());
        buf.extend_from_slice(&self.flags_fragment.to_be_bytes());
        buf.push(self.ttl);
        buf.push(self.protocol);
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.dst.octets());
        buf.extend_from_slice(&self.options);
        Ok(buf)
    }
}

/// RFC 1071 ones-complement checksum over a header.
fn header_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        sum += u32::from(u16::from_be_bytes([bytes[i], bytes[i + 1]]));
        i += 2;
    }
    if bytes.len() % 2 != 0 {
        sum += u32::from(bytes[bytes.len() - 1]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// True if the header already carries a shim layer.
pub fn is_shimmed(header: &Ipv4Header) -> bool {
    header.protocol == SHIM_PROTOCOL
}

/// Insert `hop` into the packet's shim-layer route record, creating the
/// record if the packet is not yet shimmed.
///
/// The total-length field is recomputed and the checksum zeroed; both the
/// returned header and payload are ready for [`serialize`].
pub fn shim(
    mut header: Ipv4Header,
    payload: Vec<u8>,
    hop: RouterEntry,
) -> Result<(Ipv4Header, Vec<u8>), ShimError> {
    let (mut record, rest) = if is_shimmed(&header) {
        let (record, consumed) = RouteRecord::decode(&payload)?;
        (record, payload[consumed..].to_vec())
    } else {
        (RouteRecord::new(header.protocol), payload)
    };

    record.path.push(hop);
    let encoded = record.encode()?;

    let total = header.header_len() + encoded.len() + rest.len();
    if total > u16::MAX as usize {
        return Err(ShimError::PacketTooLarge(total));
    }

    header.total_length = total as u16;
    header.protocol = SHIM_PROTOCOL;
    header.checksum = 0;

    let mut new_payload = encoded;
    new_payload.extend_from_slice(&rest);
    Ok((header, new_payload))
}

/// Remove the shim layer from a packet, if present.
///
/// Restores the original protocol number and total length. Unshimmed
/// packets pass through untouched with no extracted record.
pub fn unshim(
    mut header: Ipv4Header,
    payload: Vec<u8>,
) -> Result<(Ipv4Header, Vec<u8>, Option<RouteRecord>), ShimError> {
    if !is_shimmed(&header) {
        return Ok((header, payload, None));
    }

    let (record, consumed) = RouteRecord::decode(&payload)?;
    let rest = payload[consumed..].to_vec();

    header.protocol = record.protocol;
    header.total_length = (header.header_len() + rest.len()) as u16;
    header.checksum = 0;

    Ok((header, rest, Some(record)))
}

/// Produce final on-wire bytes with the header checksum recomputed.
///
/// Fails if the header invariants are violated; callers are expected to
/// drop the packet rather than forward malformed output.
pub fn serialize(header: &Ipv4Header, payload: &[u8]) -> Result<Vec<u8>, ShimError> {
    let actual = header.header_len() + payload.len();
    if header.total_length as usize != actual {
        return Err(ShimError::LengthMismatch {
            total_length: header.total_length,
            actual,
        });
    }

    let unsummed = header.to_bytes(0)?;
    let checksum = header_checksum(&unsummed);

    let mut packet = header.to_bytes(checksum)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Interception hook for a forwarding router: stamp the packet with this
/// router's attestation toward its destination.
///
/// Non-IPv4 packets are accepted untouched; a packet that cannot be
/// re-serialized is dropped rather than forwarded malformed. Loopback
/// pass-through is the interception layer's policy, applied before
/// calling this.
pub fn stamp_forwarded(packet: &[u8], auth: &NonceAuthenticator, router: Ipv4Addr) -> Verdict {
    let (header, payload) = match Ipv4Header::parse(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "passing through unparseable packet");
            return Verdict::Accept;
        }
    };

    let hop = RouterEntry::new(auth, router, header.dst);
    match shim(header, payload.to_vec(), hop).and_then(|(h, p)| serialize(&h, &p)) {
        Ok(bytes) => Verdict::Replace(bytes),
        Err(e) => {
            warn!(error = %e, "dropping packet that failed shim insertion");
            Verdict::Drop
        }
    }
}

/// Interception hook for a receiving host: strip the shim before the
/// kernel delivers the packet locally, returning the extracted record
/// for the local policy module.
pub fn strip_inbound(packet: &[u8]) -> (Verdict, Option<RouteRecord>) {
    let (header, payload) = match Ipv4Header::parse(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "passing through unparseable packet");
            return (Verdict::Accept, None);
        }
    };

    if !is_shimmed(&header) {
        return (Verdict::Accept, None);
    }

    match unshim(header, payload.to_vec()) {
        Ok((header, rest, record)) => match serialize(&header, &rest) {
            Ok(bytes) => (Verdict::Replace(bytes), record),
            Err(e) => {
                warn!(error = %e, "dropping packet that failed shim removal");
                (Verdict::Drop, None)
            }
        },
        Err(e) => {
            warn!(error = %e, "dropping packet with malformed shim");
            (Verdict::Drop, None)
        }
    }
}
