//! Domain event message payloads.
//!
//! These are the inner payloads carried by [`Message`](crate::Message) envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vitalwatch_core::{AlertCandidate, TelemetryRecord};

pub use vitalwatch_core::{InvalidationMessage, InvalidationScope};

/// A batch of telemetry records handed to the evaluation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBatch {
    /// Identifier echoed back in the matching [`AlertsRaised`].
    #[serde(default = "Uuid::new_v4")]
    pub batch_id: Uuid,
    pub records: Vec<TelemetryRecord>,
}

/// Alert candidates produced by evaluating one [`TelemetryBatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsRaised {
    pub batch_id: Uuid,
    pub candidates: Vec<AlertCandidate>,
    /// Records in the source batch, including skipped ones.
    pub evaluated_records: u64,
    /// Wall-clock evaluation time in milliseconds.
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::topics;

    #[test]
    fn invalidation_roundtrips_through_envelope() {
        let event = InvalidationMessage::new(InvalidationScope::Tenant(3), "rule 12 updated");
        let msg = Message::new(topics::RULES_INVALIDATED, &event).unwrap();
        let decoded: InvalidationMessage = msg.decode().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn telemetry_batch_defaults_batch_id() {
        let batch: TelemetryBatch = serde_json::from_str(
            r#"{"records": [{"device_sn": "SN-1", "user_id": 1, "tenant_id": 1}]}"#,
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(!batch.batch_id.is_nil());
    }
}
