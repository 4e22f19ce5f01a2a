//! In-process bus with the same semantics as the Redis transport.
//!
//! Used by tests and single-process deployments. Fan-out is a
//! `tokio::sync::broadcast` channel; `disconnect()` simulates a broker outage
//! by failing every open subscriber and refusing new connections until
//! `reconnect()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::traits::{EventBus, EventPublisher, EventSubscriber};

#[derive(Debug, Clone)]
enum Frame {
    Message(Message),
    Disconnect,
}

#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Frame>,
    connected: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Fail all open subscribers and refuse new connections.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Frame::Disconnect);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn ensure_connected(&self) -> Result<(), EisenbahnError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EisenbahnError::Transport("memory bus is disconnected".into()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        self.ensure_connected()?;
        let topic = message.topic.clone();
        // No receivers is not an error: PUB/SUB drops unobserved messages.
        let receivers = self.tx.send(Frame::Message(message)).unwrap_or(0);
        debug!(topic = %topic, receivers, "published message");
        Ok(())
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publisher(&self) -> Result<Arc<dyn EventPublisher>, EisenbahnError> {
        self.ensure_connected()?;
        Ok(Arc::new(self.clone()))
    }

    async fn subscriber(&self) -> Result<Box<dyn EventSubscriber>, EisenbahnError> {
        self.ensure_connected()?;
        Ok(Box::new(MemorySubscriber {
            rx: Mutex::new(self.tx.subscribe()),
            prefixes: RwLock::new(Vec::new()),
        }))
    }
}

struct MemorySubscriber {
    rx: Mutex<broadcast::Receiver<Frame>>,
    prefixes: RwLock<Vec<String>>,
}

impl MemorySubscriber {
    fn matches(&self, topic: &str) -> bool {
        match self.prefixes.read() {
            Ok(prefixes) => prefixes.iter().any(|p| topic.starts_with(p.as_str())),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl EventSubscriber for MemorySubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), EisenbahnError> {
        self.prefixes
            .write()
            .map_err(|_| EisenbahnError::Transport("subscription list poisoned".into()))?
            .push(topic_prefix.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<Message, EisenbahnError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(Frame::Message(msg)) if self.matches(&msg.topic) => return Ok(msg),
                Ok(Frame::Message(_)) => continue,
                Ok(Frame::Disconnect) => {
                    return Err(EisenbahnError::Transport("memory bus disconnected".into()))
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(EisenbahnError::Transport(format!(
                        "subscriber lagged, {missed} messages dropped"
                    )))
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EisenbahnError::Transport("memory bus closed".into()))
                }
            }
        }
    }
}
