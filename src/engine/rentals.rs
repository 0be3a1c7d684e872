use std::sync::Arc;

use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{apply_rental_event, devices, Engine, EngineError, SlotReleasePolicy};

/// Rental lifecycle transitions.
///
/// Every transition takes the rental's write lock, checks the status
/// precondition under it and only then journals + applies, so two racing
/// transitions can never both win. Transitions that move the slot counter
/// take the device's write lock first (lock order: user → device → rental).
///
/// Re-invoking a transition whose target state already holds is a no-op
/// `Ok`; any other precondition miss is `PreconditionFailed`.
impl Engine {
    pub async fn create_rental(
        &self,
        id: Ulid,
        order_id: Ulid,
        user_id: Ulid,
        device_id: Ulid,
        duration_ms: Ms,
        pricing: Pricing,
        now: Ms,
    ) -> Result<(), EngineError> {
        if duration_ms <= 0 {
            return Err(EngineError::LimitExceeded("rental duration must be positive"));
        }
        if self.rentals.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let user_lock = self
            .user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _user_guard = user_lock.lock().await;

        if !self.config.allow_concurrent_rentals
            && self
                .active_by_user
                .get(&user_id)
                .is_some_and(|active| !active.is_empty())
        {
            return Err(EngineError::UserHasActiveRental(user_id));
        }

        let device = self
            .get_device(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut dev = device.write().await;
        if dev.available_slots == 0 {
            metrics::counter!(observability::SLOT_UNAVAILABLE_TOTAL).increment(1);
            return Err(EngineError::SlotUnavailable(device_id));
        }

        let event = Event::RentalCreated {
            id,
            order_id,
            user_id,
            device_id,
            duration_ms,
            pricing,
            created_at: now,
        };
        self.wal_append(&event).await?;

        let reserved = devices::reserve_slot(&mut dev);
        debug_assert!(reserved, "slot vanished while holding the device lock");
        self.rentals.insert(
            id,
            Arc::new(tokio::sync::RwLock::new(Rental::new(
                id, order_id, user_id, device_id, duration_ms, pricing, now,
            ))),
        );
        self.rental_by_order.insert(order_id, id);
        self.active_by_user.entry(user_id).or_default().push(id);
        self.rentals_by_device.entry(device_id).or_default().push(id);
        self.notify.send(device_id, &event);
        metrics::counter!(observability::RENTALS_CREATED_TOTAL).increment(1);
        Ok(())
    }

    pub async fn mark_paid(&self, id: Ulid) -> Result<(), EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rental.write().await;
        match guard.status {
            RentalStatus::Pending => {}
            RentalStatus::Paid => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }
        let event = Event::RentalPaid { id };
        self.persist_rental_event(&mut guard, None, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "mark_paid")
            .increment(1);
        Ok(())
    }

    pub async fn unlock(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rental.write().await;
        match guard.status {
            RentalStatus::Paid => {}
            RentalStatus::InUse => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }
        let event = Event::RentalUnlocked {
            id,
            unlocked_at: now,
            expected_return_at: now + guard.duration_ms,
        };
        self.persist_rental_event(&mut guard, None, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "unlock").increment(1);
        Ok(())
    }

    /// Flag an in-use rental whose expected return is in the past. The slot
    /// stays reserved — the device is still physically occupied.
    pub async fn mark_overdue(&self, id: Ulid) -> Result<(), EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rental.write().await;
        match guard.status {
            RentalStatus::InUse => {}
            RentalStatus::Overdue => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }
        let event = Event::RentalOverdue { id };
        self.persist_rental_event(&mut guard, None, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "mark_overdue")
            .increment(1);
        tracing::info!("rental {id} is overdue");
        Ok(())
    }

    /// Record the device back. Returns the overtime fee charged (zero when
    /// on time). Whether the slot frees here or at completion is the
    /// engine's release policy.
    pub async fn return_rental(&self, id: Ulid, returned_at: Ms) -> Result<Cents, EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let device_id = rental.read().await.device_id;

        let release_now = self.config.slot_release == SlotReleasePolicy::OnReturn;
        let device = if release_now {
            Some(
                self.get_device(&device_id)
                    .ok_or(EngineError::NotFound(device_id))?,
            )
        } else {
            None
        };
        let mut dev_guard = match &device {
            Some(d) => Some(d.write().await),
            None => None,
        };
        let mut guard = rental.write().await;
        match guard.status {
            RentalStatus::InUse | RentalStatus::Overdue => {}
            RentalStatus::Returned => return Ok(guard.overtime_fee),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }

        let overtime_fee = match guard.expected_return_at {
            Some(due) => overtime_charge(returned_at - due, guard.overtime_rate),
            None => 0,
        };
        let event = Event::RentalReturned {
            id,
            returned_at,
            overtime_fee,
            slot_released: release_now && !guard.slot_released,
        };
        self.wal_append(&event).await?;
        apply_rental_event(&mut guard, dev_guard.as_deref_mut(), &event);
        self.finish_active(guard.user_id, id);
        self.notify.send(device_id, &event);
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "return").increment(1);
        Ok(overtime_fee)
    }

    /// Close out a returned rental: release the slot if still held, accrue
    /// commissions and the merchant earning, emit the completed event.
    pub async fn complete(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let device_id = rental.read().await.device_id;
        let device = self
            .get_device(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut dev = device.write().await;
        let mut guard = rental.write().await;
        match guard.status {
            RentalStatus::Returned => {}
            RentalStatus::Completed => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }

        // Accruals are journaled before the completion record: a crash in
        // between leaves the rental Returned, the auto-complete sweep
        // retries, and per-(order, target) dedup absorbs the replay.
        self.accrue_order(&guard, now).await?;

        let event = Event::RentalCompleted {
            id,
            completed_at: now,
        };
        self.wal_append(&event).await?;
        apply_rental_event(&mut guard, Some(&mut dev), &event);
        self.notify.send(device_id, &event);
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "complete")
            .increment(1);
        Ok(())
    }

    /// Cancel a rental that never ran its course, releasing its slot.
    /// `PaymentTimeout` and `PaymentFailed` only apply to still-unpaid
    /// rentals, so an automated cancel can never race out a rental that
    /// won a concurrent payment.
    pub async fn cancel(&self, id: Ulid, reason: CancelReason) -> Result<(), EngineError> {
        let rental = self.get_rental(&id).ok_or(EngineError::NotFound(id))?;
        let device_id = rental.read().await.device_id;
        let device = self
            .get_device(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut dev = device.write().await;
        let mut guard = rental.write().await;
        match (guard.status, reason) {
            (RentalStatus::Cancelled, _) => return Ok(()),
            (RentalStatus::Pending, _) => {}
            (RentalStatus::Paid, CancelReason::UserRequest) => {}
            (status, _) => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }

        let event = Event::RentalCancelled { id, reason };
        self.wal_append(&event).await?;
        apply_rental_event(&mut guard, Some(&mut dev), &event);
        self.finish_active(guard.user_id, id);
        self.notify.send(device_id, &event);
        metrics::counter!(observability::TRANSITIONS_TOTAL, "transition" => "cancel").increment(1);
        Ok(())
    }
}
