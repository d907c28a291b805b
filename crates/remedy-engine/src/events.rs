//! Event queue consumer.
//!
//! Drains the durable event queue in batches and hands each event to the
//! [`Matcher`]. Successful events are deleted; failed ones are released with
//! an exponential retry delay until they exhaust their attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use remedy_store::Store;
use remedy_types::{Event, channels, now};

use crate::error::Result;
use crate::matcher::Matcher;
use crate::notifier::Notifier;

/// Pause after a failed batch before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const RETRY_BASE_SECS: i64 = 5;
const RETRY_MAX_SECS: i64 = 600;

/// Settings for the consumer loop.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Consumes change events and turns them into runs.
#[derive(Debug)]
pub struct EventConsumer {
    store: Arc<Store>,
    notifier: Notifier,
    matcher: Arc<Matcher>,
    settings: ConsumerSettings,
}

impl EventConsumer {
    pub fn new(
        store: Arc<Store>,
        notifier: Notifier,
        matcher: Arc<Matcher>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            matcher,
            settings,
        }
    }

    /// Append an event to the queue and wake the consumer.
    pub fn publish(&self, event: &Event) -> Result<()> {
        self.store.publish_event(event)?;
        self.notifier.publish(channels::EVENT_QUEUE_UPDATED);
        Ok(())
    }

    /// Claim and process one batch. Returns the number of events claimed.
    pub fn consume(&self) -> Result<usize> {
        let events = self
            .store
            .claim_events(self.settings.batch_size, self.settings.max_attempts)?;

        for event in &events {
            match self.matcher.handle(event) {
                Ok(runs) => {
                    debug!(event_id = %event.id, event = %event.name, runs = runs.len(), "Event processed");
                    self.store.delete_event(event.id)?;
                }
                Err(e) => {
                    let attempt = event.attempts + 1;
                    let retry_at = now() + chrono::Duration::seconds(retry_delay_secs(attempt));
                    warn!(
                        event_id = %event.id,
                        event = %event.name,
                        attempt,
                        error = %e,
                        "Event processing failed, will retry"
                    );
                    if attempt >= self.settings.max_attempts {
                        error!(event_id = %event.id, event = %event.name, "Event exhausted its attempts");
                    }
                    self.store.fail_event(event.id, &e.to_string(), retry_at)?;
                }
            }
        }
        Ok(events.len())
    }

    /// Consume until `shutdown` fires.
    ///
    /// Drains while batches come back non-empty, then idles until notified
    /// or the poll interval elapses.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut wake = self.notifier.subscribe(&[channels::EVENT_QUEUE_UPDATED]);
        info!("Event consumer started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.consume() {
                Ok(n) if n > 0 => continue,
                Ok(_) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = wake.wait(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Event consumer failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!("Event consumer stopped");
    }
}

/// Delay before retry number `attempt` (1-based): 5s, 10s, 20s, ... capped
/// at ten minutes.
fn retry_delay_secs(attempt: u32) -> i64 {
    let shift = attempt.saturating_sub(1).min(16);
    (RETRY_BASE_SECS << shift).min(RETRY_MAX_SECS)
}
