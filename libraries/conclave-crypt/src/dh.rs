use std::fmt;
use std::str::FromStr;

use derivative::Derivative;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::base64::Base64;
use serde_with::{Bytes, IfIsHumanReadable, serde_as};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::ParseKeyError;
use crate::encoding;
use crate::redacted_debug;

/// Errors returned by Diffie-Hellman operations.
#[derive(Debug, Error)]
pub enum DhError {
    #[error("invalid shared secret")]
    InvalidSharedSecret,
}

/// X25519 public key used for short-term group key agreement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DhPublic(x25519_dalek::PublicKey);

/// X25519 static secret key used for short-term group key agreement.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct DhSecret(
    #[derivative(Debug(format_with = "redacted_debug"))] x25519_dalek::StaticSecret,
);

#[serde_as]
#[derive(Serialize, Deserialize)]
struct DhPublicSerde(#[serde_as(as = "IfIsHumanReadable<Base64, Bytes>")] [u8; 32]);

impl DhPublic {
    /// Build a public key from its 32-byte form.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Serialize the public key as 32 bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub(crate) fn as_inner(&self) -> &x25519_dalek::PublicKey {
        &self.0
    }
}

impl fmt::Display for DhPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encoding::encode_32_base64(self.to_bytes()))
    }
}

impl FromStr for DhPublic {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = encoding::decode_32_base64(s)?;
        Ok(DhPublic::from_bytes(bytes))
    }
}

impl Serialize for DhPublic {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        DhPublicSerde(self.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DhPublic {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let DhPublicSerde(bytes) = DhPublicSerde::deserialize(deserializer)?;
        Ok(DhPublic::from_bytes(bytes))
    }
}

impl DhSecret {
    /// Generate a random DH secret.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self(x25519_dalek::StaticSecret::random_from_rng(&mut rng))
    }

    /// Build a DH secret from 32 raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the matching public key for this secret.
    pub fn public_key(&self) -> DhPublic {
        DhPublic(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman with a peer public key, returning the shared secret bytes.
    pub fn diffie_hellman(&self, peer: &DhPublic) -> Result<[u8; 32], DhError> {
        let ss = self.0.diffie_hellman(peer.as_inner()).to_bytes();
        if ss.ct_eq(&[0u8; 32]).unwrap_u8() == 1 {
            return Err(DhError::InvalidSharedSecret);
        }
        Ok(ss)
    }
}

/// Derive the group's shared symmetric key from a pairwise ECDH fan-out.
///
/// Peer public keys are ordered by lexicographic comparison of their 32-byte
/// form, so every member concatenates the pairwise secrets identically no
/// matter what order the roster was delivered in. The local public key takes
/// no part in the fan-out.
pub fn derive_group_key(local: &DhSecret, peers: &[DhPublic]) -> Result<[u8; 32], DhError> {
    let own = local.public_key().to_bytes();
    let mut sorted: Vec<[u8; 32]> = peers.iter().map(DhPublic::to_bytes).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for peer in sorted {
        if peer == own {
            continue;
        }
        let ss = local.diffie_hellman(&DhPublic::from_bytes(peer))?;
        hasher.update(ss);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::{DhPublic, DhSecret, derive_group_key};

    #[test]
    fn serde_json_round_trip_and_printing() {
        let secret = DhSecret::from_bytes([7u8; 32]);
        let public = secret.public_key();

        let public_json = serde_json::to_string(&public).expect("public to json");
        let public_val: serde_json::Value =
            serde_json::from_str(&public_json).expect("public json value");
        assert!(public_val.is_string());

        let public_back: DhPublic = serde_json::from_str(&public_json).expect("public from json");
        assert_eq!(public.to_bytes(), public_back.to_bytes());

        let displayed = public.to_string();
        let parsed: DhPublic = displayed.parse().expect("public from string");
        assert_eq!(public.to_bytes(), parsed.to_bytes());
    }

    #[test]
    fn three_members_derive_the_same_key() {
        let a = DhSecret::from_bytes([1u8; 32]);
        let b = DhSecret::from_bytes([2u8; 32]);
        let c = DhSecret::from_bytes([3u8; 32]);

        let key_a =
            derive_group_key(&a, &[b.public_key(), c.public_key()]).expect("key for a");
        let key_b =
            derive_group_key(&b, &[c.public_key(), a.public_key()]).expect("key for b");
        let key_c =
            derive_group_key(&c, &[a.public_key(), b.public_key()]).expect("key for c");

        assert_eq!(key_a, key_b);
        assert_eq!(key_b, key_c);
    }

    #[test]
    fn derivation_ignores_roster_delivery_order() {
        let a = DhSecret::from_bytes([4u8; 32]);
        let b = DhSecret::from_bytes([5u8; 32]);
        let c = DhSecret::from_bytes([6u8; 32]);

        let forward = derive_group_key(&a, &[b.public_key(), c.public_key()]).expect("forward");
        let reversed = derive_group_key(&a, &[c.public_key(), b.public_key()]).expect("reversed");
        assert_eq!(forward, reversed);
    }

    #[test]
    fn lone_member_derives_a_stable_key() {
        let a = DhSecret::random();
        let b = DhSecret::random();
        assert_eq!(
            derive_group_key(&a, &[]).expect("a"),
            derive_group_key(&b, &[]).expect("b"),
        );
    }

    #[test]
    fn dh_rejects_all_zero_shared_secret() {
        let secret = DhSecret::random();
        let low_order = DhPublic::from_bytes([0u8; 32]);
        assert!(secret.diffie_hellman(&low_order).is_err());
    }
}
