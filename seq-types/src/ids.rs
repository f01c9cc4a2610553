//! Identity and ordering types for chatseq.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::SeqError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = SeqError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| SeqError::InvalidId(format!("{}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for a chat.
    ChatId
);

uuid_id!(
    /// A unique identifier for a user (issued by the external identity service).
    UserId
);

uuid_id!(
    /// A unique, stable identifier for a message.
    ///
    /// Survives forwarding and recovery unchanged; the client may choose it
    /// before the first send so that retried sends are idempotent.
    MessageId
);

/// A unique identifier for one device of a user.
///
/// 32 bytes of random data, displayed and serialized as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Create a new random DeviceId.
    pub fn random() -> Result<Self, SeqError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| SeqError::Internal(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Create a DeviceId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes of this DeviceId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &self.to_string()[..8])
    }
}

impl FromStr for DeviceId {
    type Err = SeqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| SeqError::InvalidId(format!("DeviceId: {e}")))?;
        Self::from_bytes(&bytes)
            .ok_or_else(|| SeqError::InvalidId(format!("DeviceId: expected 32 bytes, got {}", bytes.len())))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Monotonic per-chat message ordinal.
///
/// Assigned by the sequence store at commit time, never by clients.
/// Zero means "nothing applied yet"; the first message of a chat is 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SeqNum(u64);

impl SeqNum {
    /// Create a new SeqNum with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this SeqNum.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The "nothing applied yet" position.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next ordinal.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNum({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_base64_display() {
        let id = DeviceId::random().unwrap();
        assert_eq!(id.to_string().len(), 43); // 32 bytes = 43 base64 chars (no padding)
    }

    #[test]
    fn device_id_parses_its_display() {
        let id = DeviceId::random().unwrap();
        let parsed: DeviceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn device_id_from_invalid_length_fails() {
        assert!(DeviceId::from_bytes(&[0u8; 16]).is_none());
        assert!(DeviceId::from_bytes(&[0u8; 64]).is_none());
        assert!("AAAA".parse::<DeviceId>().is_err());
    }

    #[test]
    fn device_id_serializes_as_string() {
        let id = DeviceId::from_bytes(&[7u8; 32]).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn chat_id_serializes_as_plain_uuid() {
        let id = ChatId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn chat_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<ChatId>().is_err());
    }

    #[test]
    fn seq_num_ordering() {
        assert!(SeqNum::new(100) < SeqNum::new(200));
        assert_eq!(SeqNum::new(7).max(SeqNum::new(3)), SeqNum::new(7));
    }

    #[test]
    fn seq_num_serializes_as_number() {
        assert_eq!(serde_json::to_string(&SeqNum::new(42)).unwrap(), "42");
    }

    #[test]
    fn seq_num_next_saturates() {
        assert_eq!(SeqNum::new(100).next().value(), 101);
        assert_eq!(SeqNum::new(u64::MAX).next().value(), u64::MAX);
    }
}
