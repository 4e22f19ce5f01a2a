use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("invalid invalidation scope: {0}")]
    InvalidScope(String),

    #[error("sign '{sign}' value {value:?} is not numeric")]
    SignConversion { sign: String, value: String },

    #[error("{0}")]
    Other(String),
}
