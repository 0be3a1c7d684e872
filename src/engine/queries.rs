use ulid::Ulid;

use crate::model::*;

use super::Engine;

/// Typed filter for rental listings — every query names its predicates
/// instead of passing an untyped filter bag.
#[derive(Debug, Clone, Copy, Default)]
pub struct RentalFilter {
    pub device_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub status: Option<RentalStatus>,
    pub created_before: Option<Ms>,
    pub due_before: Option<Ms>,
}

/// Conservation check data for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAccounting {
    pub slot_count: u32,
    pub available_slots: u32,
    /// Rentals on the device still holding their slot reservation.
    pub outstanding: u32,
}

fn rental_info(r: &Rental) -> RentalInfo {
    RentalInfo {
        id: r.id,
        order_id: r.order_id,
        user_id: r.user_id,
        device_id: r.device_id,
        status: r.status,
        fee: r.fee,
        overtime_fee: r.overtime_fee,
        created_at: r.created_at,
        expected_return_at: r.expected_return_at,
        returned_at: r.returned_at,
    }
}

/// Read-side projections. Scans use `try_read` and skip records under
/// mutation — they are retried on the caller's next pass.
impl Engine {
    pub fn list_rentals(&self, filter: &RentalFilter) -> Vec<RentalInfo> {
        let mut out = Vec::new();
        for entry in self.rentals.iter() {
            let Ok(r) = entry.value().try_read() else {
                continue;
            };
            if let Some(device_id) = filter.device_id
                && r.device_id != device_id
            {
                continue;
            }
            if let Some(user_id) = filter.user_id
                && r.user_id != user_id
            {
                continue;
            }
            if let Some(status) = filter.status
                && r.status != status
            {
                continue;
            }
            if let Some(cutoff) = filter.created_before
                && r.created_at > cutoff
            {
                continue;
            }
            if let Some(cutoff) = filter.due_before
                && !r.expected_return_at.is_some_and(|due| due < cutoff)
            {
                continue;
            }
            out.push(rental_info(&r));
        }
        out
    }

    pub fn get_rental_info(&self, id: &Ulid) -> Option<RentalInfo> {
        let rental = self.get_rental(id)?;
        let guard = rental.try_read().ok()?;
        Some(rental_info(&guard))
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .filter_map(|entry| {
                let d = entry.value().try_read().ok()?;
                Some(DeviceInfo {
                    id: d.id,
                    slot_count: d.slot_count,
                    available_slots: d.available_slots,
                })
            })
            .collect()
    }

    pub fn get_payment_info(&self, id: &Ulid) -> Option<PaymentInfo> {
        let payment = self.get_payment(id)?;
        let guard = payment.try_read().ok()?;
        let refunded = guard
            .refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Success)
            .map(|r| r.amount)
            .sum();
        Some(PaymentInfo {
            id: guard.id,
            order_id: guard.order_id,
            amount: guard.amount,
            status: guard.status,
            expires_at: guard.expires_at,
            refunded,
        })
    }

    pub fn list_commissions(&self, order_id: Option<Ulid>) -> Vec<CommissionInfo> {
        self.commissions
            .iter()
            .filter_map(|entry| {
                let c = entry.value().try_read().ok()?;
                if let Some(order) = order_id
                    && c.order_id != order
                {
                    return None;
                }
                Some(CommissionInfo {
                    id: c.id,
                    order_id: c.order_id,
                    distributor_id: c.distributor_id,
                    level: c.level,
                    amount: c.amount,
                    status: c.status,
                })
            })
            .collect()
    }

    pub fn list_settlements(&self) -> Vec<SettlementInfo> {
        self.settlements
            .iter()
            .map(|entry| {
                let s = entry.value();
                SettlementInfo {
                    id: s.id,
                    kind: s.kind,
                    target_id: s.target_id,
                    period_start: s.period_start,
                    period_end: s.period_end,
                    total_amount: s.total_amount,
                    entry_count: s.entry_count,
                }
            })
            .collect()
    }

    /// Conservation triple for a device:
    /// `available_slots + outstanding == slot_count` at every quiet point.
    pub fn device_accounting(&self, device_id: &Ulid) -> Option<DeviceAccounting> {
        let device = self.get_device(device_id)?;
        let guard = device.try_read().ok()?;
        let rental_ids = self
            .rentals_by_device
            .get(device_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let outstanding = rental_ids
            .iter()
            .filter_map(|id| self.get_rental(id))
            .filter_map(|r| r.try_read().ok().map(|g| !g.slot_released))
            .filter(|held| *held)
            .count() as u32;
        Some(DeviceAccounting {
            slot_count: guard.slot_count,
            available_slots: guard.available_slots,
            outstanding,
        })
    }

    // ── Sweep range scans ────────────────────────────────────

    /// Pending rentals created at or before `cutoff`, oldest-first window
    /// bounded by `limit`.
    pub fn pending_created_before(&self, cutoff: Ms, limit: usize) -> Vec<Ulid> {
        self.scan_rentals(limit, |r| {
            r.status == RentalStatus::Pending && r.created_at <= cutoff
        })
    }

    /// In-use rentals whose expected return is already past.
    pub fn in_use_due_before(&self, now: Ms, limit: usize) -> Vec<Ulid> {
        self.scan_rentals(limit, |r| {
            r.status == RentalStatus::InUse && r.expected_return_at.is_some_and(|due| due < now)
        })
    }

    /// Returned rentals whose settle-delay window has elapsed.
    pub fn returned_before(&self, cutoff: Ms, limit: usize) -> Vec<Ulid> {
        self.scan_rentals(limit, |r| {
            r.status == RentalStatus::Returned && r.returned_at.is_some_and(|at| at <= cutoff)
        })
    }

    fn scan_rentals(&self, limit: usize, pred: impl Fn(&Rental) -> bool) -> Vec<Ulid> {
        let mut out = Vec::new();
        for entry in self.rentals.iter() {
            if out.len() >= limit {
                break;
            }
            if let Ok(r) = entry.value().try_read()
                && pred(&r)
            {
                out.push(r.id);
            }
        }
        out
    }
}
