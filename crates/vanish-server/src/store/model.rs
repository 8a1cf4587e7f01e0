use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::crypto::NONCE_LEN;

/// Stored as bincode behind a one-byte format marker, keyed by token.
/// `ciphertext` is ChaCha20Poly1305 output (value + tag) with the token as AAD.
/// Timestamps stay in the clear so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    pub ciphertext: Vec<u8>,
    /// Per-record random nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds; the record is unreadable once `now` passes this.
    pub expires_at: i64,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
