use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::traits::{EventBus, EventPublisher, EventSubscriber};

/// Redis PUBLISH-based publisher.
///
/// Each message is published on the channel named by its topic, with the
/// MessagePack-encoded [`Message`] envelope as the payload.
pub struct RedisPublisher {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisPublisher {
    /// Open a managed (auto-reconnecting) connection for publishing.
    #[instrument(skip_all)]
    pub async fn connect(client: &redis::Client, timeout: Duration) -> Result<Self, EisenbahnError> {
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| EisenbahnError::Timeout(timeout))??;
        info!("redis publisher connected");
        Ok(Self { conn, timeout })
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        let envelope_bytes = message.to_bytes()?;
        let mut conn = self.conn.clone();

        let receivers: i64 = tokio::time::timeout(
            self.timeout,
            redis::cmd("PUBLISH")
                .arg(&message.topic)
                .arg(envelope_bytes)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| EisenbahnError::Timeout(self.timeout))??;

        debug!(topic = %message.topic, receivers, "published message");
        Ok(())
    }
}

/// Redis pattern subscriber.
///
/// Owns a dedicated pub/sub connection. Topic prefixes become `PSUBSCRIBE`
/// patterns (`prefix*`). Payloads that are not a [`Message`] envelope are
/// wrapped with [`Message::raw`] so non-Rust publishers can post plain JSON.
pub struct RedisSubscriber {
    pubsub: Mutex<PubSub>,
    timeout: Duration,
}

impl RedisSubscriber {
    #[instrument(skip_all)]
    pub async fn connect(client: &redis::Client, timeout: Duration) -> Result<Self, EisenbahnError> {
        let pubsub = tokio::time::timeout(timeout, client.get_async_pubsub())
            .await
            .map_err(|_| EisenbahnError::Timeout(timeout))??;
        info!("redis subscriber connected");
        Ok(Self {
            pubsub: Mutex::new(pubsub),
            timeout,
        })
    }
}

#[async_trait]
impl EventSubscriber for RedisSubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), EisenbahnError> {
        let pattern = format!("{topic_prefix}*");
        let mut pubsub = self.pubsub.lock().await;
        tokio::time::timeout(self.timeout, pubsub.psubscribe(&pattern))
            .await
            .map_err(|_| EisenbahnError::Timeout(self.timeout))??;
        info!(pattern = %pattern, "subscribed to topic prefix");
        Ok(())
    }

    async fn recv(&self) -> Result<Message, EisenbahnError> {
        let mut pubsub = self.pubsub.lock().await;
        let msg = pubsub
            .on_message()
            .next()
            .await
            .ok_or_else(|| EisenbahnError::Transport("redis pub/sub stream closed".into()))?;

        let channel = msg.get_channel_name().to_string();
        let payload = msg.get_payload_bytes();
        match Message::from_bytes(payload) {
            Ok(message) => {
                debug!(topic = %message.topic, "received message");
                Ok(message)
            }
            Err(e) => {
                debug!(channel = %channel, error = %e, "payload is not an envelope, passing through raw");
                Ok(Message::raw(channel, payload.to_vec()))
            }
        }
    }
}

/// [`EventBus`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisBus {
    /// Parse the URL. No connection is made until a publisher or subscriber is requested.
    pub fn open(url: &str, connect_timeout: Duration) -> Result<Self, EisenbahnError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connect_timeout,
        })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publisher(&self) -> Result<Arc<dyn EventPublisher>, EisenbahnError> {
        let publisher = RedisPublisher::connect(&self.client, self.connect_timeout).await?;
        Ok(Arc::new(publisher))
    }

    async fn subscriber(&self) -> Result<Box<dyn EventSubscriber>, EisenbahnError> {
        match RedisSubscriber::connect(&self.client, self.connect_timeout).await {
            Ok(sub) => Ok(Box::new(sub)),
            Err(e) => {
                warn!(error = %e, "failed to open redis subscriber");
                Err(e)
            }
        }
    }
}
