//! In-process pub/sub for wake-up notifications.
//!
//! Publishers announce that something changed on a named channel
//! (`run.created`, `event_queue.updated`, ...). Subscribers use it only as a
//! hint to re-check the store, so a dropped notification costs at most one
//! poll interval. When the underlying channel is torn down the subscriber
//! re-attaches with exponential backoff capped at one minute.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Broadcasts channel names to every subscriber.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: Arc<Mutex<broadcast::Sender<String>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Arc::new(Mutex::new(tx)),
        }
    }

    /// Announce a change on `channel`. Never blocks; no subscribers is fine.
    pub fn publish(&self, channel: &str) {
        let _ = self.sender.lock().send(channel.to_string());
    }

    /// Subscribe to the given channels.
    pub fn subscribe(&self, channels: &[&str]) -> Subscription {
        Subscription {
            notifier: self.clone(),
            receiver: self.sender.lock().subscribe(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            backoff: INITIAL_BACKOFF,
        }
    }

    /// Replace the underlying channel, disconnecting current subscribers.
    ///
    /// Subscribers observe the disconnect and re-attach on their own.
    pub fn reset(&self) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        *self.sender.lock() = tx;
    }
}

/// A filtered view of the notifier for one consumer loop.
#[derive(Debug)]
pub struct Subscription {
    notifier: Notifier,
    receiver: broadcast::Receiver<String>,
    channels: Vec<String>,
    backoff: Duration,
}

impl Subscription {
    /// Wait until a notification arrives on one of the subscribed channels.
    ///
    /// Lagging behind counts as a wake-up: some notifications were lost, so
    /// the caller should re-check.
    pub async fn recv(&mut self) -> String {
        loop {
            match self.receiver.recv().await {
                Ok(channel) => {
                    self.backoff = INITIAL_BACKOFF;
                    if self.channels.is_empty() || self.channels.contains(&channel) {
                        return channel;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification subscriber lagged, forcing a re-check");
                    return String::new();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(backoff_ms = self.backoff.as_millis() as u64, "Notifier closed, re-subscribing");
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                    self.receiver = self.notifier.sender.lock().subscribe();
                }
            }
        }
    }

    /// Wait for a notification or until `timeout` elapses, whichever is first.
    /// Returns `true` when woken by a notification.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.recv()).await.is_ok()
    }
}
