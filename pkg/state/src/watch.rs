use pkg_constants::state::EVENT_CHANNEL_CAPACITY;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::store::Collection;
use crate::txn::Change;

/// Key of a committed document change.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub collection: Collection,
    pub id: String,
}

/// Broadcasts the keys of committed changes.
/// Stores emit into it after every successful transaction.
#[derive(Clone)]
pub struct EventLog {
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Record the changes of one committed transaction.
    pub fn emit(&self, changes: &[Change]) {
        for change in changes {
            let event = WatchEvent {
                collection: change.collection,
                id: change.id.clone(),
            };
            // Broadcast to subscribers (ignore errors if no receivers)
            let _ = self.sender.send(event);
        }
    }

    /// Subscribe to changes of documents in `collection` whose id starts with `id_prefix`.
    pub fn notifier(&self, collection: Collection, id_prefix: &str) -> Notifier {
        Notifier {
            events: BroadcastStream::new(self.sender.subscribe()),
            collection,
            id_prefix: id_prefix.to_string(),
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes a waiter when a matching document changes.
///
/// Delivery is at-least-once per change but coalescing: a receiver that
/// falls behind gets a single notification for everything it missed.
pub struct Notifier {
    events: BroadcastStream<WatchEvent>,
    collection: Collection,
    id_prefix: String,
}

impl Notifier {
    /// Wait for the next matching change. Returns `false` once the store
    /// has gone away and no further notifications can arrive.
    pub async fn changed(&mut self) -> bool {
        while let Some(item) = self.events.next().await {
            match item {
                Ok(event) => {
                    if event.collection == self.collection && event.id.starts_with(&self.id_prefix) {
                        return true;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(_)) => return true,
            }
        }
        false
    }
}
