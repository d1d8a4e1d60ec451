use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::base64::Base64;
use serde_with::serde_as;
use thiserror::Error;
use conclave_crypt::dh::DhPublic;

use crate::id::MemberId;

/// Errors returned by envelope encoding and decoding.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode error")]
    Encode,
    #[error("decode error")]
    Decode,
    #[error("unknown message type {0}")]
    UnknownKind(u8),
}

/// Type tag carried in every envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    NewGroupKey,
    MakeNewKey,
    NewPeerKeys,
    Text,
}

impl MsgKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MsgKind::NewGroupKey => 1,
            MsgKind::MakeNewKey => 2,
            MsgKind::NewPeerKeys => 3,
            MsgKind::Text => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, WireError> {
        match tag {
            1 => Ok(MsgKind::NewGroupKey),
            2 => Ok(MsgKind::MakeNewKey),
            3 => Ok(MsgKind::NewPeerKeys),
            4 => Ok(MsgKind::Text),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl Serialize for MsgKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_u8().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MsgKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = u8::deserialize(deserializer)?;
        MsgKind::from_u8(tag).map_err(serde::de::Error::custom)
    }
}

/// Frame exchanged in both directions: a type tag plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload under the given type tag.
    pub fn pack<T: Serialize>(kind: MsgKind, payload: &T) -> Result<Self, WireError> {
        let data = serde_json::to_value(payload).map_err(|_| WireError::Encode)?;
        Ok(Self { kind, data })
    }

    /// Decode the payload as the given type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        serde_json::from_value(self.data.clone()).map_err(|_| WireError::Decode)
    }

    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|_| WireError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, WireError> {
        serde_json::from_str(raw).map_err(|_| WireError::Decode)
    }
}

/// Rotated group access key, sealed to one member's long-term key.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewGroupKey {
    #[serde(rename = "newkey")]
    #[serde_as(as = "Base64")]
    pub new_key: Vec<u8>,
}

/// Server request for a fresh short-term key; carries no fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MakeNewKeyRequest {}

/// Member reply carrying the public half of its fresh short-term keypair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MakeNewKeyResponse {
    #[serde(rename = "pub")]
    pub public: DhPublic,
}

/// Short-term roster delivered to each member, excluding its own key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewPeerKeys {
    pub keys: Vec<DhPublic>,
}

/// Ciphertext submitted by a sender for relay.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Text {
    #[serde_as(as = "Base64")]
    pub contents: Vec<u8>,
}

/// Ciphertext as relayed to every other member.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextForward {
    #[serde_as(as = "Base64")]
    pub contents: Vec<u8>,
    pub sender: MemberId,
}
