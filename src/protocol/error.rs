//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
///
/// All of these mean the datagram or packet should be discarded; none are
/// fatal to the receive loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: 0x{0:02x}")]
    InvalidMessageType(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("route record path too long: {0} hops (max 255)")]
    PathTooLong(usize),
}
