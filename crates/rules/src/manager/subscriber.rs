//! Background listener for rule invalidations.
//!
//! One task per process. It holds the bus rather than a subscriber so it can
//! reconnect after a broker outage; after any gap it clears the local map,
//! since invalidations published during the gap are lost.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vitalwatch_eisenbahn::{EisenbahnError, EventBus, EventSubscriber};

use super::core::RuleCacheManager;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// How long `stop` waits for the listener before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub(super) struct SubscriberHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl SubscriberHandle {
    pub fn new(handle: JoinHandle<()>, shutdown: Arc<Notify>) -> Self {
        Self { handle, shutdown }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn stop(mut self) {
        // notify_one stores a permit, so a listener busy handling a message
        // still sees the signal at its next wait.
        self.shutdown.notify_one();
        match tokio::time::timeout(STOP_GRACE, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "invalidation listener task ended abnormally"),
            Err(_) => {
                warn!(grace_ms = STOP_GRACE.as_millis() as u64, "invalidation listener did not stop, aborting");
                self.handle.abort();
                let _ = self.handle.await;
            }
        }
    }
}

enum Exit {
    Shutdown,
    Disconnected,
}

pub(super) struct Listener {
    manager: Weak<RuleCacheManager>,
    bus: Arc<dyn EventBus>,
    topic: String,
    max_backoff: Duration,
    subscribe_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl Listener {
    pub fn new(
        manager: Weak<RuleCacheManager>,
        bus: Arc<dyn EventBus>,
        topic: String,
        max_backoff: Duration,
        subscribe_timeout: Duration,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            manager,
            bus,
            topic,
            max_backoff: max_backoff.max(INITIAL_BACKOFF),
            subscribe_timeout,
            shutdown,
        }
    }

    /// One bounded subscribe attempt. A broker that accepts the connection
    /// and then stalls counts as a failed attempt.
    async fn connect(&self) -> Result<Box<dyn EventSubscriber>, EisenbahnError> {
        let attempt = async {
            let subscriber = self.bus.subscriber().await?;
            subscriber.subscribe(&self.topic).await?;
            Ok::<_, EisenbahnError>(subscriber)
        };
        tokio::time::timeout(self.subscribe_timeout, attempt)
            .await
            .unwrap_or(Err(EisenbahnError::Timeout(self.subscribe_timeout)))
    }

    /// Connect, listen, and reconnect with capped exponential backoff until
    /// shut down. `ready` reports whether the first attempt connected.
    pub async fn run(self, ready: oneshot::Sender<bool>) {
        let mut ready = Some(ready);
        let mut backoff = INITIAL_BACKOFF;
        let mut missed = false;

        loop {
            let attempt = tokio::select! {
                attempt = self.connect() => attempt,
                _ = self.shutdown.notified() => return,
            };
            match attempt {
                Ok(subscriber) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(true);
                    }
                    if missed {
                        match self.manager.upgrade() {
                            Some(manager) => manager.on_resubscribed(),
                            None => return,
                        }
                    }
                    backoff = INITIAL_BACKOFF;
                    debug!(topic = %self.topic, "subscribed to invalidations");

                    if let Exit::Shutdown = self.listen(subscriber.as_ref()).await {
                        return;
                    }
                }
                Err(e) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(false);
                    }
                    warn!(
                        topic = %self.topic,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "invalidation subscribe failed"
                    );
                }
            }
            missed = true;

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.notified() => return,
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn listen(&self, subscriber: &dyn EventSubscriber) -> Exit {
        loop {
            tokio::select! {
                received = subscriber.recv() => match received {
                    Ok(message) => {
                        let Some(manager) = self.manager.upgrade() else {
                            return Exit::Shutdown;
                        };
                        manager.handle_bus_message(&message);
                    }
                    Err(e) => {
                        warn!(topic = %self.topic, error = %e, "invalidation subscriber lost connection");
                        return Exit::Disconnected;
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("invalidation listener shutting down");
                    return Exit::Shutdown;
                }
            }
        }
    }
}
