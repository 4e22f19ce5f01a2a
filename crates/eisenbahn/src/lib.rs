pub mod error;
pub mod memory;
pub mod message;
pub mod messages;
pub mod pubsub;
pub mod traits;

pub use error::EisenbahnError;
pub use memory::MemoryBus;
pub use message::Message;
pub use messages::events;
pub use messages::topics;
pub use pubsub::{RedisBus, RedisPublisher, RedisSubscriber};
pub use traits::{EventBus, EventPublisher, EventSubscriber};
