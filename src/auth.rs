//! Keyed-nonce authentication for route records.
//!
//! A router attests that it forwarded a packet toward a destination by
//! stamping the packet with an 8-byte nonce derived from a keyed hash of
//! the destination address. The router can later recognize its own
//! attestation without keeping any per-packet state, and nobody without
//! the key can forge one.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Size of a route-record nonce in bytes.
pub const NONCE_SIZE: usize = 8;

/// Generates and verifies the truncated keyed-hash nonces carried in
/// route records.
///
/// The nonce is the last [`NONCE_SIZE`] bytes of HMAC-SHA1(key, data),
/// where `data` is the 4-byte destination address being attested. The key
/// is a static pre-shared secret owned by this instance; there is no
/// process-wide key state, so tests can run several differently-keyed
/// parties side by side.
#[derive(Clone)]
pub struct NonceAuthenticator {
    key: Vec<u8>,
}

impl NonceAuthenticator {
    /// Create an authenticator with the given pre-shared key.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> HmacSha1 {
        HmacSha1::new_from_slice(&self.key).expect("HMAC accepts keys of any length")
    }

    /// Compute the nonce for the given data (the destination address).
    pub fn nonce(&self, data: &[u8]) -> [u8; NONCE_SIZE] {
        let mut mac = self.mac();
        mac.update(data);
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[digest.len() - NONCE_SIZE..]);
        nonce
    }

    /// Check a candidate nonce against the given data.
    ///
    /// Recomputes the keyed hash and compares the trailing bytes in
    /// constant time.
    pub fn is_authentic(&self, candidate: &[u8; NONCE_SIZE], data: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(data);
        mac.verify_truncated_right(candidate).is_ok()
    }
}

impl std::fmt::Debug for NonceAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material.
        f.debug_struct("NonceAuthenticator").finish_non_exhaustive()
    }
}
