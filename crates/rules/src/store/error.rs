/// Errors from the authoritative rule store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned into a rule.
    #[error("invalid rule row {rule_id}: {reason}")]
    InvalidRow { rule_id: i64, reason: String },

    #[error("rule store unavailable: {0}")]
    Unavailable(String),
}
