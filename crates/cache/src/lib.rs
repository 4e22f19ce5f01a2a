//! Shared-tier cache client and lease-based distributed lock.
//!
//! This crate provides:
//! - [`ValueCache`]: namespaced key/value, counter, set and hash operations
//!   that contain every transport failure and never raise
//! - [`Serializer`]: Structured (JSON) / Opaque (MessagePack) / Raw codecs with a
//!   tiered decode fallback on reads
//! - [`DistributedMutex`]: set-if-absent lease with atomic compare-and-delete release
//! - [`CacheBackend`] implementations for Redis and an in-memory fake

pub mod backend;
pub mod codec;
pub mod error;
pub mod lock;
pub mod value_cache;

pub use backend::memory::MemoryBackend;
pub use backend::redis::RedisBackend;
pub use backend::CacheBackend;
pub use codec::{CacheValue, Serializer};
pub use error::{CacheError, CacheResult, CodecError, LockError};
pub use lock::DistributedMutex;
pub use value_cache::{CacheStats, ValueCache};
