//! Error types for the cache layer.
//!
//! `CacheError` never escapes [`ValueCache`](crate::ValueCache); it is used
//! between the backends and the client, and by [`DistributedMutex`](crate::DistributedMutex)
//! callers that need to tell connectivity from contention.

use std::time::Duration;

/// Transport-level failure talking to the shared tier.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Backend deliberately offline (in-memory fake) or not connected yet.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Value stored under a key has the wrong type for the operation.
    #[error("wrong type for key {0}")]
    WrongType(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Encoding failure for one of the [`Serializer`](crate::Serializer) variants.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json encode: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),

    /// The raw serializer only accepts strings and byte sequences.
    #[error("raw serializer needs a string or byte sequence")]
    NotRaw,
}

/// Outcome of a failed lock operation.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder owns the lease. Retry with backoff or give up.
    #[error("lock {key} is held by another owner")]
    Contention { key: String },

    /// The shared tier could not be reached; the lock state is unknown.
    #[error("lock {key} unreachable: {source}")]
    Connectivity {
        key: String,
        #[source]
        source: CacheError,
    },

    #[error("lock {key} is not held by this mutex")]
    NotHeld { key: String },
}

impl LockError {
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Contention { .. })
    }
}
