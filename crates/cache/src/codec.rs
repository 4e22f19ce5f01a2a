//! Value codecs for the shared tier.
//!
//! Writes pick one [`Serializer`]. Reads do not know which one was used, so
//! [`decode`] walks a fallback chain: JSON, then MessagePack, then hand the
//! bytes back untouched as [`CacheValue::Raw`].

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Encoding used when writing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    /// JSON. Readable by every service sharing the cache.
    #[default]
    Structured,
    /// MessagePack with field names. Compact; meant for maps, structs and
    /// sequences. A bare small integer can be mistaken for JSON on read.
    Opaque,
    /// Bytes stored as-is. Accepts strings and byte sequences only.
    Raw,
}

impl Serializer {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Serializer::Structured => Ok(serde_json::to_vec(value)?),
            Serializer::Opaque => Ok(rmp_serde::to_vec_named(value)?),
            Serializer::Raw => raw_bytes(value),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Serializer::Structured => "structured",
            Serializer::Opaque => "opaque",
            Serializer::Raw => "raw",
        }
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serializer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(Serializer::Structured),
            "opaque" | "msgpack" | "binary" => Ok(Serializer::Opaque),
            "raw" => Ok(Serializer::Raw),
            other => Err(format!("unknown serializer '{other}'")),
        }
    }
}

fn raw_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s.into_bytes()),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or(CodecError::NotRaw)
            })
            .collect(),
        _ => Err(CodecError::NotRaw),
    }
}

/// Result of reading a value whose encoding is not known up front.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue<T> {
    /// One of the structured decoders produced a `T`.
    Decoded(T),
    /// Neither decoder accepted the bytes.
    Raw(Vec<u8>),
}

impl<T> CacheValue<T> {
    pub fn decoded(self) -> Option<T> {
        match self {
            CacheValue::Decoded(v) => Some(v),
            CacheValue::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, CacheValue::Raw(_))
    }
}

/// Decode with the JSON → MessagePack → raw chain. Never fails.
pub fn decode<T: DeserializeOwned>(bytes: Vec<u8>) -> CacheValue<T> {
    if let Ok(v) = serde_json::from_slice::<T>(&bytes) {
        return CacheValue::Decoded(v);
    }
    if let Ok(v) = rmp_serde::from_slice::<T>(&bytes) {
        return CacheValue::Decoded(v);
    }
    CacheValue::Raw(bytes)
}
