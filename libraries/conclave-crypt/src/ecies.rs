use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use derivative::Derivative;
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::ParseKeyError;
use crate::encoding;
use crate::redacted_debug;

/// AES-256-GCM with the 16-byte nonce the hybrid encryption profile uses.
type EciesCipher = AesGcm<Aes256, U16>;

const POINT_LEN: usize = 65;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Errors returned by hybrid public-key encryption.
#[derive(Debug, Error)]
pub enum EciesError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// secp256k1 public key used to receive hybrid-encrypted payloads.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EciesPublic(k256::PublicKey);

/// secp256k1 secret key held for the life of a client session.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct EciesSecret(#[derivative(Debug(format_with = "redacted_debug"))] k256::SecretKey);

impl EciesPublic {
    /// Serialize the public key in uncompressed SEC1 form (65 bytes).
    pub fn to_bytes(&self) -> [u8; 65] {
        let point = self.0.to_encoded_point(false);
        let mut buf = [0u8; 65];
        buf.copy_from_slice(point.as_bytes());
        buf
    }

    /// Build a public key from its uncompressed SEC1 form.
    pub fn from_bytes(bytes: &[u8; 65]) -> Result<Self, ParseKeyError> {
        let inner =
            k256::PublicKey::from_sec1_bytes(bytes).map_err(|_| ParseKeyError::InvalidPublicKey)?;
        Ok(Self(inner))
    }

    /// Encrypt `plaintext` to this key.
    ///
    /// Output layout is `ephemeral_pub(65) ‖ nonce(16) ‖ tag(16) ‖ ciphertext`,
    /// with the symmetric key drawn from HKDF-SHA256 over the ephemeral public
    /// key and the uncompressed shared point.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EciesError> {
        let ephemeral = k256::SecretKey::random(&mut rand::thread_rng());
        let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);
        let key = shared_key(&ephemeral, &self.0, ephemeral_pub.as_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = EciesCipher::new(Key::<EciesCipher>::from_slice(&key));
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&nonce), plaintext)
            .map_err(|_| EciesError::Encrypt)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(POINT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }
}

impl fmt::Display for EciesPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for EciesPublic {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = encoding::decode_65_hex(s)?;
        EciesPublic::from_bytes(&bytes)
    }
}

impl EciesSecret {
    /// Generate a random secret key.
    pub fn random() -> Self {
        Self(k256::SecretKey::random(&mut rand::thread_rng()))
    }

    /// Derive the matching public key for this secret.
    pub fn public_key(&self) -> EciesPublic {
        EciesPublic(self.0.public_key())
    }

    /// Decrypt a payload produced by [`EciesPublic::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, EciesError> {
        if sealed.len() < POINT_LEN + NONCE_LEN + TAG_LEN {
            return Err(EciesError::Decrypt);
        }
        let (ephemeral_bytes, rest) = sealed.split_at(POINT_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let ephemeral_pub =
            k256::PublicKey::from_sec1_bytes(ephemeral_bytes).map_err(|_| EciesError::Decrypt)?;
        let key = shared_key(&self.0, &ephemeral_pub, ephemeral_bytes);

        let mut sealed_body = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed_body.extend_from_slice(ciphertext);
        sealed_body.extend_from_slice(tag);
        let cipher = EciesCipher::new(Key::<EciesCipher>::from_slice(&key));
        cipher
            .decrypt(Nonce::<U16>::from_slice(nonce), sealed_body.as_slice())
            .map_err(|_| EciesError::Decrypt)
    }
}

/// HKDF-SHA256 over `ephemeral_pub ‖ uncompressed(secret · public)`.
///
/// Both sides feed the same ephemeral public key bytes, so the derivation is
/// symmetric between encryptor and decryptor.
fn shared_key(
    secret: &k256::SecretKey,
    public: &k256::PublicKey,
    ephemeral_pub: &[u8],
) -> [u8; 32] {
    let scalar = *secret.to_nonzero_scalar();
    let shared_point = (public.to_projective() * scalar).to_affine();
    let shared_bytes = shared_point.to_encoded_point(false);

    let mut master = Vec::with_capacity(ephemeral_pub.len() + POINT_LEN);
    master.extend_from_slice(ephemeral_pub);
    master.extend_from_slice(shared_bytes.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, &master);
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key).expect("32 bytes is a valid HKDF length");
    key
}

#[cfg(test)]
mod tests {
    use super::{EciesPublic, EciesSecret};

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secret = EciesSecret::random();
        let sealed = secret
            .public_key()
            .encrypt(b"rotating group token")
            .expect("encrypt");
        let opened = secret.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, b"rotating group token");
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let alice = EciesSecret::random();
        let mallory = EciesSecret::random();
        let sealed = alice.public_key().encrypt(b"secret").expect("encrypt");
        assert!(mallory.decrypt(&sealed).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = EciesSecret::random();
        let mut sealed = secret.public_key().encrypt(b"secret").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(secret.decrypt(&sealed).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let secret = EciesSecret::random();
        assert!(secret.decrypt(&[0u8; 64]).is_err());
    }

    #[test]
    fn hex_round_trip_is_uncompressed() {
        let public = EciesSecret::random().public_key();
        let encoded = public.to_string();
        assert_eq!(encoded.len(), 130);
        assert!(encoded.starts_with("04"));
        let parsed: EciesPublic = encoded.parse().expect("parse");
        assert_eq!(parsed, public);
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!("zz".parse::<EciesPublic>().is_err());
        assert!("04deadbeef".parse::<EciesPublic>().is_err());
    }
}
