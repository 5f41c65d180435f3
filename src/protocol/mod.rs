//! AITF filter request protocol messages.
//!
//! Five messages drive a filter negotiation between a victim, the routers
//! along the offending path, and the attacker:
//!
//! 1. `FilterReq` — victim asks its gateway (and later the attacker) to
//!    block a flow.
//! 2. `CounterConnectionSyn` / `SynAck` / `Ack` — a three-way handshake
//!    between two routers, confirming the filter request really came from
//!    a router that forwarded the offending traffic.
//! 3. `FilterAck` — compliance acknowledgement flowing back toward the
//!    victim.
//!
//! ## Wire Format
//!
//! | Offset | Field    | Size     | Notes                               |
//! |--------|----------|----------|--------------------------------------|
//! | 0      | type     | 1 byte   | [`MessageType`] value               |
//! | 1      | attacker | 4 bytes  | Alleged attacker (flow source)      |
//! | 5      | victim   | 4 bytes  | Alleged victim (flow destination)   |
//! | 9      | route    | variable | [`RouteRecord`] encoding            |
//! | ...    | nonce    | 8 bytes  | Only for the counter-connection types |
//!
//! Big-endian. Presence of the trailing nonce is decided by the type
//! byte, never by leftover length.

mod error;

pub use error::ProtocolError;

use std::fmt;
use std::net::Ipv4Addr;

use crate::auth::NonceAuthenticator;
use crate::record::RouteRecord;

/// Well-known UDP port for filter request messages.
pub const AITF_PORT: u16 = 54321;

/// Upper bound on an encoded filter message; generous for any realistic
/// path length (255 hops encode to just over 3 KB).
pub const MAX_DATAGRAM: usize = 5000;

/// Fixed prefix: type byte plus two IPv4 addresses.
const MESSAGE_HEADER_SIZE: usize = 9;

/// Trailing handshake nonce size.
const HANDSHAKE_NONCE_SIZE: usize = 8;

/// Which step of the filter request process a message is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Sent by a victim to its nearest router to start a filter request,
    /// and later by a router to the attacking host.
    FilterReq = 0,
    /// Sent by the victim's router to the attacker's router to open the
    /// counter-connection handshake.
    CounterConnectionSyn = 1,
    /// Handshake reply carrying a fresh nonce.
    CounterConnectionSynAck = 2,
    /// Handshake completion echoing the nonce.
    CounterConnectionAck = 3,
    /// Compliance acknowledgement.
    FilterAck = 4,
}

impl MessageType {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageType::FilterReq),
            1 => Some(MessageType::CounterConnectionSyn),
            2 => Some(MessageType::CounterConnectionSynAck),
            3 => Some(MessageType::CounterConnectionAck),
            4 => Some(MessageType::FilterAck),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True for the three handshake messages that carry a trailing nonce.
    pub fn carries_nonce(self) -> bool {
        matches!(
            self,
            MessageType::CounterConnectionSyn
                | MessageType::CounterConnectionSynAck
                | MessageType::CounterConnectionAck
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::FilterReq => "FilterReq",
            MessageType::CounterConnectionSyn => "CounterConnectionSyn",
            MessageType::CounterConnectionSynAck => "CounterConnectionSynAck",
            MessageType::CounterConnectionAck => "CounterConnectionAck",
            MessageType::FilterAck => "FilterAck",
        };
        write!(f, "{}", name)
    }
}

/// The accusation every filter message carries: who is flooding whom, and
/// the recorded path the offending traffic took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowClaim {
    /// Alleged attacker (source of the offending flow).
    pub attacker: Ipv4Addr,
    /// Alleged victim (destination of the offending flow).
    pub victim: Ipv4Addr,
    /// Path record of the offending traffic.
    pub route: RouteRecord,
}

impl FlowClaim {
    /// A claim is authentic iff its route record verifies against the
    /// alleged victim: some router on the path genuinely forwarded
    /// traffic toward the victim.
    pub fn authentic(&self, auth: &NonceAuthenticator) -> bool {
        self.route.is_authentic(auth, self.victim)
    }
}

/// One filter-protocol message.
///
/// The counter-connection variants carry the 64-bit handshake nonce; the
/// other two have no nonce at all rather than a meaningless zero field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterMessage {
    FilterReq(FlowClaim),
    CounterConnectionSyn { claim: FlowClaim, nonce: u64 },
    CounterConnectionSynAck { claim: FlowClaim, nonce: u64 },
    CounterConnectionAck { claim: FlowClaim, nonce: u64 },
    FilterAck(FlowClaim),
}

impl FilterMessage {
    /// The wire type tag for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            FilterMessage::FilterReq(_) => MessageType::FilterReq,
            FilterMessage::CounterConnectionSyn { .. } => MessageType::CounterConnectionSyn,
            FilterMessage::CounterConnectionSynAck { .. } => MessageType::CounterConnectionSynAck,
            FilterMessage::CounterConnectionAck { .. } => MessageType::CounterConnectionAck,
            FilterMessage::FilterAck(_) => MessageType::FilterAck,
        }
    }

    /// The flow claim carried by any message kind.
    pub fn claim(&self) -> &FlowClaim {
        match self {
            FilterMessage::FilterReq(claim) | FilterMessage::FilterAck(claim) => claim,
            FilterMessage::CounterConnectionSyn { claim, .. }
            | FilterMessage::CounterConnectionSynAck { claim, .. }
            | FilterMessage::CounterConnectionAck { claim, .. } => claim,
        }
    }

    /// The handshake nonce, for the three counter-connection kinds.
    pub fn handshake_nonce(&self) -> Option<u64> {
        match self {
            FilterMessage::CounterConnectionSyn { nonce, .. }
            | FilterMessage::CounterConnectionSynAck { nonce, .. }
            | FilterMessage::CounterConnectionAck { nonce, .. } => Some(*nonce),
            _ => None,
        }
    }

    /// Delegate authenticity to the embedded claim.
    pub fn authentic(&self, auth: &NonceAuthenticator) -> bool {
        self.claim().authentic(auth)
    }

    /// Encode in the fixed big-endian wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let claim = self.claim();
        let route = claim.route.encode()?;

        let mut buf =
            Vec::with_capacity(MESSAGE_HEADER_SIZE + route.len() + HANDSHAKE_NONCE_SIZE);
        buf.push(self.message_type().to_byte());
        buf.extend_from_slice(&claim.attacker.octets());
        buf.extend_from_slice(&claim.victim.octets());
        buf.extend_from_slice(&route);
        if let Some(nonce) = self.handshake_nonce() {
            buf.extend_from_slice(&nonce.to_be_bytes());
        }

        if buf.len() > MAX_DATAGRAM {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_DATAGRAM,
                got: buf.len(),
            });
        }

        Ok(buf)
    }

    /// Decode a message from a full datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: MESSAGE_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let msg_type =
            MessageType::from_byte(buf[0]).ok_or(ProtocolError::InvalidMessageType(buf[0]))?;
        let attacker = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
        let victim = Ipv4Addr::new(buf[5], buf[6], buf[7], buf[8]);

        let (route, consumed) = RouteRecord::decode(&buf[MESSAGE_HEADER_SIZE..])?;
        let claim = FlowClaim {
            attacker,
            victim,
            route,
        };

        let nonce_at = MESSAGE_HEADER_SIZE + consumed;

        // Exhaustive on purpose: a new message type must decide its own
        // decoding here.
        Ok(match msg_type {
            MessageType::FilterReq => FilterMessage::FilterReq(claim),
            MessageType::FilterAck => FilterMessage::FilterAck(claim),
            MessageType::CounterConnectionSyn => FilterMessage::CounterConnectionSyn {
                claim,
                nonce: read_trailing_nonce(buf, nonce_at)?,
            },
            MessageType::CounterConnectionSynAck => FilterMessage::CounterConnectionSynAck {
                claim,
                nonce: read_trailing_nonce(buf, nonce_at)?,
            },
            MessageType::CounterConnectionAck => FilterMessage::CounterConnectionAck {
                claim,
                nonce: read_trailing_nonce(buf, nonce_at)?,
            },
        })
    }
}

/// Read the 8-byte handshake nonce the counter-connection types carry
/// after their route record.
fn read_trailing_nonce(buf: &[u8], at: usize) -> Result<u64, ProtocolError> {
    let end = at + HANDSHAKE_NONCE_SIZE;
    if buf.len() < end {
        return Err(ProtocolError::MessageTooShort {
            expected: end,
            got: buf.len(),
        });
    }

    let mut bytes = [0u8; HANDSHAKE_NONCE_SIZE];
    bytes.copy_from_slice(&buf[at..end]);
    Ok(u64::from_be_bytes(bytes))
}
