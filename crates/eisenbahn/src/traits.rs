use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EisenbahnError;
use crate::message::Message;

/// Publishes messages to every subscriber of the message's topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message. Subscribers filter by the message's topic.
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        (**self).publish(message).await
    }
}

/// Subscribes to messages matching topic prefixes.
///
/// A subscriber owns one broker connection. Dropping it closes the connection.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to messages with topics matching the given prefix.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), EisenbahnError>;

    /// Receive the next message. Blocks until a message is available.
    ///
    /// An error means the connection is no longer usable and the caller
    /// should open a new subscriber.
    async fn recv(&self) -> Result<Message, EisenbahnError>;
}

/// Connection factory for a broker.
///
/// Long-running listeners hold the bus rather than a subscriber so they can
/// reconnect after the broker goes away.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publisher(&self) -> Result<Arc<dyn EventPublisher>, EisenbahnError>;

    async fn subscriber(&self) -> Result<Box<dyn EventSubscriber>, EisenbahnError>;
}
