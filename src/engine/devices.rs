use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::{Device, Event};

use super::{Engine, EngineError};

/// Take one slot from the device. Fails without side effect at zero.
///
/// Together with `release_slot` this is the only code allowed to touch
/// `available_slots`; both run under the device's write lock, so check and
/// update are one step rather than a read-then-write across round trips.
pub(super) fn reserve_slot(device: &mut Device) -> bool {
    if device.available_slots == 0 {
        return false;
    }
    device.available_slots -= 1;
    true
}

/// Give one slot back. Clamped at `slot_count` as an upper bound against
/// double-release bugs.
pub(super) fn release_slot(device: &mut Device) {
    if device.available_slots < device.slot_count {
        device.available_slots += 1;
    } else {
        tracing::warn!(
            "slot release on device {} ignored: already at capacity {}",
            device.id,
            device.slot_count
        );
    }
}

impl Engine {
    pub async fn register_device(&self, id: Ulid, slot_count: u32) -> Result<(), EngineError> {
        if self.devices.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::DeviceRegistered { id, slot_count };
        self.wal_append(&event).await?;
        self.devices
            .insert(id, Arc::new(RwLock::new(Device::new(id, slot_count))));
        self.notify.send(id, &event);
        Ok(())
    }
}
