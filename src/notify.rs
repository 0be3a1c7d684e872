use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-device rental notifications ("rental overdue",
/// "rental completed", ...). Fire-and-forget: a send never blocks a state
/// transition and is a no-op when nobody is listening.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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
        }
    }

    /// Subscribe to notifications for a device. Creates the channel if needed.
    pub fn subscribe(&self, device_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(device_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, device_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&device_id) {
            let _ = sender.send(event.clone());
        }
    }
}
