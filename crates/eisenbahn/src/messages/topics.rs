//! Topic constants for PUB/SUB routing.
//!
//! Topics follow the pattern `<prefix>.<domain>.<event>`. The prefix is the
//! deployment's key prefix so several deployments can share one broker.

/// Fired by the rule source on every rule create, update or delete.
pub const RULES_INVALIDATED: &str = "rules.invalidated";

/// Telemetry batches flowing into the evaluation engine.
pub const TELEMETRY_BATCH: &str = "telemetry.batch";

/// Alert candidates produced by one evaluated batch.
pub const ALERTS_RAISED: &str = "alerts.raised";

/// Qualify a topic with a deployment prefix: `namespaced("vw", RULES_INVALIDATED)`
/// is `vw.rules.invalidated`. An empty prefix leaves the topic unchanged.
pub fn namespaced(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        topic.to_string()
    } else {
        format!("{prefix}.{topic}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing() {
        assert_eq!(namespaced("vw", RULES_INVALIDATED), "vw.rules.invalidated");
        assert_eq!(namespaced("", ALERTS_RAISED), "alerts.raised");
    }
}
