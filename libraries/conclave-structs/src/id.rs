use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Rotating access key that admits clients to a group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Uuid);

/// Identifier of a member within its group, stable for the connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(Uuid);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier")]
pub struct IdParseError;

fn parse_v4(s: &str) -> Result<Uuid, IdParseError> {
    let uuid = Uuid::try_parse(s).map_err(|_| IdParseError)?;
    if uuid.get_version_num() != 4 {
        return Err(IdParseError);
    }
    if uuid.get_variant() != uuid::Variant::RFC4122 {
        return Err(IdParseError);
    }
    Ok(uuid)
}

macro_rules! uuid_newtype {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random identifier, tagged as a version-4 UUID.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Build an identifier from its 16 raw bytes.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Serialize the identifier as 16 bytes.
            pub fn to_bytes(&self) -> [u8; 16] {
                self.0.into_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(parse_v4(s)?))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                self.to_bytes().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let bytes = <[u8; 16]>::deserialize(deserializer)?;
                Ok(Self::from_bytes(bytes))
            }
        }
    };
}

uuid_newtype!(GroupId);
uuid_newtype!(MemberId);

#[cfg(test)]
mod tests {
    use super::{GroupId, MemberId};

    #[test]
    fn format_parse_round_trip() {
        let id = GroupId::random();
        let parsed: GroupId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_canonicalizes_to_lowercase() {
        let id = MemberId::random();
        let upper = id.to_string().to_uppercase();
        let parsed: MemberId = upper.parse().expect("parse uppercase");
        assert_eq!(parsed.to_string(), id.to_string());
        assert!(parsed.to_string().chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn random_ids_carry_version_and_variant_tags() {
        let bytes = GroupId::random().to_bytes();
        assert_eq!(bytes[6] & 0xf0, 0x40);
        assert_eq!(bytes[8] & 0xc0, 0x80);
    }

    #[test]
    fn parse_rejects_wrong_version_or_variant() {
        let id = GroupId::random();
        let mut wrong_version = id.to_bytes();
        wrong_version[6] = (wrong_version[6] & 0x0f) | 0x10;
        let s = GroupId::from_bytes(wrong_version).to_string();
        assert!(s.parse::<GroupId>().is_err());

        let mut wrong_variant = id.to_bytes();
        wrong_variant[8] &= 0x3f;
        let s = GroupId::from_bytes(wrong_variant).to_string();
        assert!(s.parse::<GroupId>().is_err());
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        assert!("".parse::<GroupId>().is_err());
        assert!("not-a-uuid".parse::<GroupId>().is_err());
        assert!("fb649a97-6fb5-4ccd-b1ba".parse::<GroupId>().is_err());
    }

    #[test]
    fn member_id_serializes_as_raw_bytes() {
        let id = MemberId::random();
        let json = serde_json::to_string(&id).expect("to json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json value");
        let array = value.as_array().expect("byte array");
        assert_eq!(array.len(), 16);
        let back: MemberId = serde_json::from_str(&json).expect("from json");
        assert_eq!(back, id);
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(GroupId::random(), GroupId::random());
        assert_ne!(MemberId::random(), MemberId::random());
    }
}
