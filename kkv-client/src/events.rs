//! Change notification bus.
//!
//! [`UpdateEvents`] is the in-process channel that whatever receives change
//! notifications from the cache publishes into. Dispatchers subscribe to it
//! through [`NotificationSource`] and stop listening by dropping their stream.
//!
//! Uses a tokio broadcast channel: publishing never blocks, and a subscriber
//! that falls more than `capacity` notifications behind skips the oldest ones.

use futures_util::stream::{self, BoxStream};
use kkv_core::{ChangeNotification, NotificationSource};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct UpdateEvents {
    tx: broadcast::Sender<ChangeNotification>,
}

impl UpdateEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a notification to every current subscriber.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn emit(&self, notification: ChangeNotification) -> usize {
        match self.tx.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for change notification");
                0
            }
        }
    }

    /// Decode a raw JSON notification and publish it.
    pub fn emit_json(&self, raw: &str) -> Result<usize, serde_json::Error> {
        let notification: ChangeNotification = serde_json::from_str(raw)?;
        Ok(self.emit(notification))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for UpdateEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl NotificationSource for UpdateEvents {
    fn subscribe(&self) -> BoxStream<'static, ChangeNotification> {
        let rx = self.tx.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Update subscriber lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}
