//! Pushed change notifications.
//!
//! A change feed publishes [`InvalidationEvent`]s; the query layer treats
//! every event as an order to drop what it holds for the named collection.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A change observed by some other writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// Something in the collection changed.
    CollectionChanged { collection: String },
    /// One item changed. Still invalidates the whole collection, since any
    /// cached page may contain or now qualify for the item.
    ItemChanged { collection: String, id: String },
}

impl InvalidationEvent {
    pub fn collection_changed(collection: impl Into<String>) -> Self {
        InvalidationEvent::CollectionChanged {
            collection: collection.into(),
        }
    }

    pub fn item_changed(collection: impl Into<String>, id: impl Into<String>) -> Self {
        InvalidationEvent::ItemChanged {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            InvalidationEvent::CollectionChanged { collection }
            | InvalidationEvent::ItemChanged { collection, .. } => collection,
        }
    }
}

/// Anything that can hand out a stream of change notifications.
pub trait InvalidationSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent>;
}

/// In-process change feed over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastInvalidationSource {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl BroadcastInvalidationSource {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastInvalidationSource {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InvalidationSource for BroadcastInvalidationSource {
    fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }
}
