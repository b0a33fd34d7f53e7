//! Identifiers used across the runtime.

use core::fmt;
use core::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Byte length of an aggregate identifier.
pub const AGGREGATE_ID_LEN: usize = 13;

/// Identifier of a persisted event.
///
/// UUIDv7 under the hood: the millisecond timestamp prefix makes freshly
/// generated ids roughly sortable by creation time, which keeps store
/// indexes append-friendly. Round-trips losslessly through raw bytes, hex,
/// and URL-safe base64.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh, time-sortable id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| IdError::Invalid(format!("EventId expects 16 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|e| IdError::Invalid(format!("EventId hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, IdError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| IdError::Invalid(format!("EventId base64: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for EventId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s).map_err(|e| IdError::Invalid(format!("EventId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identifier of an aggregate (consistency boundary).
///
/// A fixed 13-byte value: 4 bytes of seconds-since-epoch followed by 9
/// random bytes when generated here, but any 13 bytes are accepted (the
/// runtime treats the id as opaque). Ordered lexicographically, so generated
/// ids sort roughly by creation time.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateId([u8; AGGREGATE_ID_LEN]);

impl AggregateId {
    /// Generate a fresh id with a time-sortable prefix.
    pub fn generate() -> Self {
        let mut bytes = [0u8; AGGREGATE_ID_LEN];
        let secs = chrono::Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[4..]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; AGGREGATE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AGGREGATE_ID_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; AGGREGATE_ID_LEN] = bytes.try_into().map_err(|_| {
            IdError::Invalid(format!(
                "AggregateId expects {AGGREGATE_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|e| IdError::Invalid(format!("AggregateId hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, IdError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| IdError::Invalid(format!("AggregateId base64: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregateId({})", self.to_hex())
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for AggregateId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for AggregateId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AggregateId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
