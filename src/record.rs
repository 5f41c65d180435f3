//! Route records: the per-packet path attestation.
//!
//! Every AITF-capable router that forwards a packet appends one
//! [`RouterEntry`] to the packet's route record. Each entry carries the
//! router's own address and a keyed nonce over the packet's destination
//! address, so the router can later confirm "I really forwarded traffic
//! toward that destination" without keeping per-packet state.
//!
//! ## Wire Format
//!
//! | Offset | Field     | Size     | Notes                        |
//! |--------|-----------|----------|------------------------------|
//! | 0      | protocol  | 1 byte   | Original IP protocol number  |
//! | 1      | hop_count | 1 byte   | Number of path entries       |
//! | 2      | path      | 12 bytes each | [addr:4][nonce:8] per hop |
//!
//! Big-endian, no padding. The protocol byte preserves the carried
//! packet's transport protocol while the shim layer replaces the IP
//! header's protocol field with the sentinel value.

use std::net::Ipv4Addr;

use crate::auth::{NonceAuthenticator, NONCE_SIZE};
use crate::protocol::ProtocolError;

/// Wire size of one path entry: 4-byte IPv4 address plus 8-byte nonce.
pub const ENTRY_WIRE_SIZE: usize = 4 + NONCE_SIZE;

/// Fixed route-record prefix: protocol byte plus hop count byte.
pub const RECORD_HEADER_SIZE: usize = 2;

/// One router's attestation that it forwarded a packet.
///
/// Immutable once created. The nonce is only meaningful to the router
/// that issued it (or any party holding the same pre-shared key).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouterEntry {
    /// Address of the attesting router.
    pub address: Ipv4Addr,
    /// Keyed nonce over the packet's destination address.
    pub nonce: [u8; NONCE_SIZE],
}

impl RouterEntry {
    /// Create an entry attesting that `address` forwarded a packet toward
    /// `destination`.
    pub fn new(auth: &NonceAuthenticator, address: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            address,
            nonce: auth.nonce(&destination.octets()),
        }
    }

    /// Check whether this entry was genuinely issued for `destination`
    /// under the authenticator's key.
    pub fn is_authentic(&self, auth: &NonceAuthenticator, destination: Ipv4Addr) -> bool {
        auth.is_authentic(&self.nonce, &destination.octets())
    }
}

/// The ordered path a packet took through AITF-capable routers, oldest
/// hop first, plus the original transport protocol of the carried packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRecord {
    /// Original IP protocol number of the shimmed packet.
    pub protocol: u8,
    /// Forwarding path, insertion order = forwarding order.
    pub path: Vec<RouterEntry>,
}

impl RouteRecord {
    /// Create an empty record for a packet of the given protocol.
    pub fn new(protocol: u8) -> Self {
        Self {
            protocol,
            path: Vec::new(),
        }
    }

    /// Append one hop: `router` attests it forwarded toward `destination`.
    pub fn add_hop(
        &mut self,
        auth: &NonceAuthenticator,
        router: Ipv4Addr,
        destination: Ipv4Addr,
    ) {
        self.path.push(RouterEntry::new(auth, router, destination));
    }

    /// True iff at least one hop in the path verifies against
    /// `destination`.
    ///
    /// A single valid hop suffices: non-attesting routers may sit between
    /// attesting ones, and any one genuine attestation proves the traffic
    /// was really forwarded toward the destination. This is deliberately
    /// weaker than verifying an unbroken chain; peers depend on it.
    pub fn is_authentic(&self, auth: &NonceAuthenticator, destination: Ipv4Addr) -> bool {
        self.path
            .iter()
            .any(|entry| entry.is_authentic(auth, destination))
    }

    /// Number of bytes the encoded record occupies on the wire.
    ///
    /// Used to patch IP total-length fields before serialization.
    pub fn wire_size(&self) -> usize {
        RECORD_HEADER_SIZE + ENTRY_WIRE_SIZE * self.path.len()
    }

    /// Encode in the fixed big-endian layout.
    ///
    /// Fails if the path no longer fits the one-byte hop count.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.path.len() > u8::MAX as usize {
            return Err(ProtocolError::PathTooLong(self.path.len()));
        }

        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.protocol);
        buf.push(self.path.len() as u8);
        for entry in &self.path {
            buf.extend_from_slice(&entry.address.octets());
            buf.extend_from_slice(&entry.nonce);
        }

        Ok(buf)
    }

    /// Decode a record from the front of `buf`.
    ///
    /// Returns the record and the number of bytes consumed, so callers
    /// embedding records mid-stream (shim payloads, filter messages) can
    /// continue past them. The declared hop count is trusted; decoding
    /// fails only if the buffer runs out before it is satisfied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: RECORD_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let protocol = buf[0];
        let hop_count = buf[1] as usize;

        let needed = RECORD_HEADER_SIZE + ENTRY_WIRE_SIZE * hop_count;
        if buf.len() < needed {
            return Err(ProtocolError::MessageTooShort {
                expected: needed,
                got: buf.len(),
            });
        }

        let mut path = Vec::with_capacity(hop_count);
        let mut pos = RECORD_HEADER_SIZE;
        for _ in 0..hop_count {
            let address = Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&buf[pos + 4..pos + ENTRY_WIRE_SIZE]);
            path.push(RouterEntry { address, nonce });
            pos += ENTRY_WIRE_SIZE;
        }

        Ok((Self { protocol, path }, needed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_auth() -> NonceAuthenticator {
        NonceAuthenticator::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_add_hop_is_authentic() {
        let auth = make_auth();
        let destination = Ipv4Addr::new(8, 8, 8, 8);

        let mut record = RouteRecord::new(6);
        record.add_hop(&auth, addr(2), destination);

        assert!(record.is_authentic(&auth, destination));
        assert!(record.path[0].is_authentic(&auth, destination));
    }

    #[test]
    fn test_authenticity_fails_for_other_destination() {
        let auth = make_auth();
        let mut record = RouteRecord::new(6);
        record.add_hop(&auth, addr(2), Ipv4Addr::new(8, 8, 8, 8));

        assert!(!record.is_authentic(&auth, Ipv4Addr::new(8, 8, 4, 4)));
    }

    #[test]
    fn test_one_valid_hop_suffices() {
        let auth = make_auth();
        let destination = Ipv4Addr::new(8, 8, 8, 8);

        // Two garbage hops surrounding one genuine attestation.
        let mut record = RouteRecord::new(17);
        record.path.push(RouterEntry {
            address: addr(1),
            nonce: [0xAA; NONCE_SIZE],
        });
        record.add_hop(&auth, addr(2), destination);
        record.path.push(RouterEntry {
            address: addr(3),
            nonce: [0x55; NONCE_SIZE],
        });

        assert!(record.is_authentic(&auth, destination));
    }

    #[test]
    fn test_forged_record_is_not_authentic() {
        let auth = make_auth();
        let record = RouteRecord {
            protocol: 6,
            path: vec![
                RouterEntry {
                    address: addr(3),
                    nonce: [5; NONCE_SIZE],
                },
                RouterEntry {
                    address: addr(2),
                    nonce: [1, 2, 3, 4, 5, 6, 7, 8],
                },
            ],
        };

        assert!(!record.is_authentic(&auth, Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_mutated_nonce_fails() {
        let auth = make_auth();
        let destination = Ipv4Addr::new(8, 8, 8, 8);
        let mut record = RouteRecord::new(6);
        record.add_hop(&auth, addr(2), destination);

        record.path[0].nonce[3] ^= 0x80;
        assert!(!record.is_authentic(&auth, destination));
    }

    #[test]
    fn test_wire_size() {
        let auth = make_auth();
        let mut record = RouteRecord::new(6);
        assert_eq!(record.wire_size(), 2);

        record.add_hop(&auth, addr(2), Ipv4Addr::new(8, 8, 8, 8));
        record.add_hop(&auth, addr(3), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(record.wire_size(), 2 + 12 * 2);
    }

    #[test]
    fn test_encode_concrete_layout() {
        let auth = make_auth();
        let destination = Ipv4Addr::new(8, 8, 8, 8);

        let mut record = RouteRecord::new(6);
        record.add_hop(&auth, addr(2), destination);
        record.add_hop(&auth, addr(3), destination);

        let encoded = record.encode().unwrap();
        assert_eq!(encoded.len(), 26);
        assert_eq!(encoded[0], 0x06);
        assert_eq!(encoded[1], 0x02);
        assert_eq!(&encoded[2..6], &[10, 0, 0, 2]);
        assert_eq!(&encoded[6..14], &auth.nonce(&destination.octets()));
        assert_eq!(&encoded[14..18], &[10, 0, 0, 3]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let auth = make_auth();
        let destination = Ipv4Addr::new(192, 0, 2, 7);

        for hops in [0usize, 1, 3, 255] {
            let mut record = RouteRecord::new(17);
            for i in 0..hops {
                record.add_hop(&auth, addr((i % 250) as u8), destination);
            }

            let encoded = record.encode().unwrap();
            assert_eq!(encoded.len(), record.wire_size());

            let (decoded, consumed) = RouteRecord::decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_decode_reports_consumed_with_trailing_bytes() {
        let auth = make_auth();
        let mut record = RouteRecord::new(6);
        record.add_hop(&auth, addr(2), Ipv4Addr::new(8, 8, 8, 8));

        let mut buf = record.encode().unwrap();
        buf.extend_from_slice(b"payload bytes");

        let (decoded, consumed) = RouteRecord::decode(&buf).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, record.wire_size());
        assert_eq!(&buf[consumed..], b"payload bytes");
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(RouteRecord::decode(&[]).is_err());
        assert!(RouteRecord::decode(&[6]).is_err());

        // Declares two hops but carries bytes for one.
        let mut buf = vec![6u8, 2];
        buf.extend_from_slice(&[0u8; ENTRY_WIRE_SIZE]);
        assert!(matches!(
            RouteRecord::decode(&buf),
            Err(ProtocolError::MessageTooShort { expected: 26, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_path() {
        let mut record = RouteRecord::new(6);
        record.path = vec![
            RouterEntry {
                address: addr(1),
                nonce: [0; NONCE_SIZE],
            };
            256
        ];

        assert!(matches!(
            record.encode(),
            Err(ProtocolError::PathTooLong(256))
        ));
    }
}
