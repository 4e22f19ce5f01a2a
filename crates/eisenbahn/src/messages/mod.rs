//! Domain-specific message types for the eisenbahn messaging layer.
//!
//! - **Event messages** (`events`): payloads published via PUB/SUB
//! - **Topic constants** (`topics`): canonical topic strings for routing

pub mod events;
pub mod topics;

pub use events::*;
