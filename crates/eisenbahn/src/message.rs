use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EisenbahnError;

/// Wire-format message envelope for inter-component communication.
///
/// Messages are serialized with MessagePack for compact, fast transport.
/// The `topic` field is the PUB/SUB channel, while `correlation_id`
/// lets a reply be matched to its request across services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic (e.g. "vitalwatch.rules.invalidated").
    pub topic: String,

    /// Encoded payload bytes. MessagePack for envelopes we produce, JSON for
    /// payloads published by services that do not speak the envelope.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID for request-response tracking and distributed tracing.
    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution. Version 0 marks a raw
    /// payload that arrived without an envelope.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Default version for messages that omit the field (backward compat).
fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    /// Create a message with an explicit correlation ID (for replies/continuations).
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        })
    }

    /// Wrap bytes that arrived on a channel without an envelope.
    pub fn raw(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: Uuid::nil(),
            version: 0,
        }
    }

    /// Deserialize the payload into the expected type.
    ///
    /// Tries MessagePack first, then JSON.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EisenbahnError> {
        match rmp_serde::from_slice(&self.payload) {
            Ok(v) => Ok(v),
            Err(rmp_err) => serde_json::from_slice(&self.payload).map_err(|json_err| {
                EisenbahnError::Deserialization(format!(
                    "msgpack: {rmp_err}; json: {json_err}"
                ))
            }),
        }
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_envelope_bytes() {
        let msg = Message::new("vw.rules.invalidated", &42u64).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.topic, "vw.rules.invalidated");
        assert_eq!(decoded.correlation_id, msg.correlation_id);
        assert_eq!(decoded.decode::<u64>().unwrap(), 42);
    }

    #[test]
    fn with_correlation_preserves_id() {
        let id = Uuid::new_v4();
        let msg = Message::with_correlation("reply", &true, id).unwrap();
        assert_eq!(msg.correlation_id, id);
    }

    #[test]
    fn raw_json_payload_decodes() {
        #[derive(Deserialize)]
        struct Ping {
            n: u32,
        }

        let msg = Message::raw("vw.ping", br#"{"n": 5}"#.to_vec());
        assert_eq!(msg.version, 0);
        assert_eq!(msg.decode::<Ping>().unwrap().n, 5);
    }

    #[test]
    fn undecodable_payload_reports_both_attempts() {
        let msg = Message::raw("vw.ping", b"\xc1not-anything".to_vec());
        let err = msg.decode::<u32>().unwrap_err().to_string();
        assert!(err.contains("msgpack"), "unexpected error: {err}");
        assert!(err.contains("json"), "unexpected error: {err}");
    }
}
