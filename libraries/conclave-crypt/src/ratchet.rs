use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use derivative::Derivative;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::redacted_debug;

/// Length of the random nonce prepended to every sealed message.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to every sealed message.
pub const TAG_LEN: usize = 16;

/// Errors returned by the symmetric ratchet.
#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Forward-secret symmetric chain key.
///
/// Advanced in place with `advance` (one SHA-256 step) once per message on
/// both the sending and receiving side; senders and receivers that fall out
/// of step can no longer decrypt each other.
#[derive(Clone, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct ChainKey(#[derivative(Debug(format_with = "redacted_debug"))] [u8; 32]);

impl ChainKey {
    /// Build a chain key from 32 raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Serialize the chain key as 32 bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Step the ratchet forward once.
    pub fn advance(&mut self) {
        self.0 = Sha256::digest(self.0).into();
    }

    /// Encrypt `plaintext` under the current chain state.
    ///
    /// Returns `nonce ‖ ciphertext ‖ tag` with a fresh random 12-byte nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RatchetError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a message previously produced by `seal` under the same chain state.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, RatchetError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(RatchetError::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RatchetError::Decrypt)
    }
}
