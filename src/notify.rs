use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Change;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed changes: one channel per resource plus a
/// global feed that sees every change.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Change>>,
    all: broadcast::Sender<Change>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes on one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Change> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Change> {
        self.all.subscribe()
    }

    /// Publish a change. No-op for channels nobody listens on.
    pub fn send(&self, change: &Change) {
        if let Some(sender) = self.channels.get(&change.resource_id) {
            let _ = sender.send(change.clone());
        }
        let _ = self.all.send(change.clone());
    }

    /// Remove a resource's channel (when the resource is deleted).
    /// Subscribers see the channel close.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}
