use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Currency minor units — the only money type.
pub type Cents = i64;

pub const MS_PER_HOUR: Ms = 3_600_000;
pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Overtime charge for `overdue_ms` at `rate` cents per hour, rounded up to
/// the next cent so a partial billing increment is never given away.
pub fn overtime_charge(overdue_ms: Ms, rate: Cents) -> Cents {
    if overdue_ms <= 0 || rate <= 0 {
        return 0;
    }
    let raw = overdue_ms as i128 * rate as i128;
    ((raw + MS_PER_HOUR as i128 - 1) / MS_PER_HOUR as i128) as Cents
}

/// Per-order commission at `rate_bps` basis points, floored to whole cents.
pub fn commission_amount(order_amount: Cents, rate_bps: u32) -> Cents {
    (order_amount as i128 * rate_bps as i128 / 10_000) as Cents
}

// ── Rental ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalStatus {
    Pending,
    Paid,
    InUse,
    Overdue,
    Returned,
    Completed,
    Cancelled,
}

impl RentalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RentalStatus::Completed | RentalStatus::Cancelled)
    }

    /// The user is still in a live rental cycle (device handed out or
    /// promised). Returned rentals are closed from the user's side even
    /// when the slot has not been released yet.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RentalStatus::Pending | RentalStatus::Paid | RentalStatus::InUse | RentalStatus::Overdue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RentalStatus::Pending => "pending",
            RentalStatus::Paid => "paid",
            RentalStatus::InUse => "in_use",
            RentalStatus::Overdue => "overdue",
            RentalStatus::Returned => "returned",
            RentalStatus::Completed => "completed",
            RentalStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a rental was cancelled. `PaymentTimeout` is reserved for the
/// reconciliation sweep and only applies to still-unpaid rentals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    PaymentTimeout,
    PaymentFailed,
    UserRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub fee: Cents,
    pub deposit: Cents,
    /// Overtime rate in cents per hour.
    pub overtime_rate: Cents,
}

#[derive(Debug, Clone)]
pub struct Rental {
    pub id: Ulid,
    pub order_id: Ulid,
    pub user_id: Ulid,
    pub device_id: Ulid,
    pub duration_ms: Ms,
    pub fee: Cents,
    pub deposit: Cents,
    pub overtime_rate: Cents,
    pub overtime_fee: Cents,
    pub status: RentalStatus,
    pub created_at: Ms,
    pub unlocked_at: Option<Ms>,
    pub expected_return_at: Option<Ms>,
    pub returned_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancel_reason: Option<CancelReason>,
    /// The one slot reservation this rental holds on its device has been
    /// given back. Set exactly once, by whichever transition releases it.
    pub slot_released: bool,
}

impl Rental {
    pub fn new(
        id: Ulid,
        order_id: Ulid,
        user_id: Ulid,
        device_id: Ulid,
        duration_ms: Ms,
        pricing: Pricing,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            order_id,
            user_id,
            device_id,
            duration_ms,
            fee: pricing.fee,
            deposit: pricing.deposit,
            overtime_rate: pricing.overtime_rate,
            overtime_fee: 0,
            status: RentalStatus::Pending,
            created_at,
            unlocked_at: None,
            expected_return_at: None,
            returned_at: None,
            completed_at: None,
            cancel_reason: None,
            slot_released: false,
        }
    }

    /// What the order is worth once usage is known: base fee plus any
    /// accrued overtime.
    pub fn order_amount(&self) -> Cents {
        self.fee + self.overtime_fee
    }
}

// ── Device ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Device {
    pub id: Ulid,
    pub slot_count: u32,
    pub available_slots: u32,
}

impl Device {
    pub fn new(id: Ulid, slot_count: u32) -> Self {
        Self {
            id,
            slot_count,
            available_slots: slot_count,
        }
    }
}

// ── Payments & refunds ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    Pending,
    Approved,
    Processing,
    Success,
    Failed,
    Rejected,
}

impl RefundStatus {
    /// Occupied-credit model: a refund counts against the payment's
    /// refundable amount from the moment it is requested, not only once it
    /// lands. Failed and rejected refunds give the credit back.
    pub fn occupies_credit(&self) -> bool {
        matches!(
            self,
            RefundStatus::Pending
                | RefundStatus::Approved
                | RefundStatus::Processing
                | RefundStatus::Success
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Processing => "processing",
            RefundStatus::Success => "success",
            RefundStatus::Failed => "failed",
            RefundStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Refund {
    pub id: Ulid,
    pub amount: Cents,
    pub status: RefundStatus,
    pub requested_at: Ms,
}

#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Ulid,
    pub order_id: Ulid,
    pub amount: Cents,
    pub status: PaymentStatus,
    pub created_at: Ms,
    /// After this instant a still-pending payment is eligible for closure.
    pub expires_at: Ms,
    pub refunds: Vec<Refund>,
}

impl Payment {
    pub fn new(id: Ulid, order_id: Ulid, amount: Cents, created_at: Ms, expires_at: Ms) -> Self {
        Self {
            id,
            order_id,
            amount,
            status: PaymentStatus::Pending,
            created_at,
            expires_at,
            refunds: Vec::new(),
        }
    }

    /// Sum of refund amounts currently holding credit on this payment.
    pub fn occupied(&self) -> Cents {
        self.refunds
            .iter()
            .filter(|r| r.status.occupies_credit())
            .map(|r| r.amount)
            .sum()
    }

    pub fn refundable(&self) -> Cents {
        self.amount - self.occupied()
    }

    pub fn refund_mut(&mut self, id: Ulid) -> Option<&mut Refund> {
        self.refunds.iter_mut().find(|r| r.id == id)
    }
}

// ── Commission, merchant earnings & settlement ───────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferralLevel {
    Direct,
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccrualStatus {
    Pending,
    Settled,
    Cancelled,
}

/// One distributor's earning on one order. At most one per
/// (order, distributor).
#[derive(Debug, Clone)]
pub struct Commission {
    pub id: Ulid,
    pub order_id: Ulid,
    pub distributor_id: Ulid,
    pub level: ReferralLevel,
    pub amount: Cents,
    pub status: AccrualStatus,
    pub accrued_at: Ms,
    pub settlement_id: Option<Ulid>,
}

/// The merchant-side remainder of a completed order, accrued alongside the
/// commissions and settled through the same batching path.
#[derive(Debug, Clone)]
pub struct MerchantEarning {
    pub id: Ulid,
    pub order_id: Ulid,
    pub merchant_id: Ulid,
    pub amount: Cents,
    pub status: AccrualStatus,
    pub accrued_at: Ms,
    pub settlement_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementKind {
    Merchant,
    Distributor,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub id: Ulid,
    pub kind: SettlementKind,
    pub target_id: Ulid,
    pub period_start: Ms,
    pub period_end: Ms,
    pub total_amount: Cents,
    pub entry_count: u32,
    pub created_at: Ms,
}

// ── Journal events ───────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
/// Slot movements are recorded explicitly (`slot_released` on the return
/// record) so replay never depends on runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DeviceRegistered {
        id: Ulid,
        slot_count: u32,
    },
    RentalCreated {
        id: Ulid,
        order_id: Ulid,
        user_id: Ulid,
        device_id: Ulid,
        duration_ms: Ms,
        pricing: Pricing,
        created_at: Ms,
    },
    RentalPaid {
        id: Ulid,
    },
    RentalUnlocked {
        id: Ulid,
        unlocked_at: Ms,
        expected_return_at: Ms,
    },
    RentalOverdue {
        id: Ulid,
    },
    RentalReturned {
        id: Ulid,
        returned_at: Ms,
        overtime_fee: Cents,
        slot_released: bool,
    },
    RentalCompleted {
        id: Ulid,
        completed_at: Ms,
    },
    RentalCancelled {
        id: Ulid,
        reason: CancelReason,
    },
    PaymentRecorded {
        id: Ulid,
        order_id: Ulid,
        amount: Cents,
        created_at: Ms,
        expires_at: Ms,
    },
    PaymentSucceeded {
        id: Ulid,
    },
    PaymentFailed {
        id: Ulid,
    },
    PaymentExpired {
        id: Ulid,
    },
    RefundRequested {
        id: Ulid,
        payment_id: Ulid,
        amount: Cents,
        requested_at: Ms,
    },
    RefundApproved {
        id: Ulid,
        payment_id: Ulid,
    },
    RefundRejected {
        id: Ulid,
        payment_id: Ulid,
    },
    RefundProcessing {
        id: Ulid,
        payment_id: Ulid,
    },
    RefundSucceeded {
        id: Ulid,
        payment_id: Ulid,
    },
    RefundFailed {
        id: Ulid,
        payment_id: Ulid,
    },
    CommissionAccrued {
        id: Ulid,
        order_id: Ulid,
        distributor_id: Ulid,
        level: ReferralLevel,
        amount: Cents,
        accrued_at: Ms,
    },
    CommissionCancelled {
        id: Ulid,
    },
    CommissionSettled {
        id: Ulid,
        settlement_id: Ulid,
    },
    MerchantFeeAccrued {
        id: Ulid,
        order_id: Ulid,
        merchant_id: Ulid,
        amount: Cents,
        accrued_at: Ms,
    },
    MerchantFeeCancelled {
        id: Ulid,
    },
    MerchantFeeSettled {
        id: Ulid,
        settlement_id: Ulid,
    },
    SettlementCreated {
        id: Ulid,
        kind: SettlementKind,
        target_id: Ulid,
        period_start: Ms,
        period_end: Ms,
        total_amount: Cents,
        entry_count: u32,
        created_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RentalInfo {
    pub id: Ulid,
    pub order_id: Ulid,
    pub user_id: Ulid,
    pub device_id: Ulid,
    pub status: RentalStatus,
    pub fee: Cents,
    pub overtime_fee: Cents,
    pub created_at: Ms,
    pub expected_return_at: Option<Ms>,
    pub returned_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: Ulid,
    pub slot_count: u32,
    pub available_slots: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInfo {
    pub id: Ulid,
    pub order_id: Ulid,
    pub amount: Cents,
    pub status: PaymentStatus,
    pub expires_at: Ms,
    pub refunded: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionInfo {
    pub id: Ulid,
    pub order_id: Ulid,
    pub distributor_id: Ulid,
    pub level: ReferralLevel,
    pub amount: Cents,
    pub status: AccrualStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementInfo {
    pub id: Ulid,
    pub kind: SettlementKind,
    pub target_id: Ulid,
    pub period_start: Ms,
    pub period_end: Ms,
    pub total_amount: Cents,
    pub entry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overtime_charge_half_hour() {
        // 30 minutes over at 600 cents/hour → exactly half the rate
        assert_eq!(overtime_charge(30 * MS_PER_MINUTE, 600), 300);
    }

    #[test]
    fn overtime_charge_rounds_up() {
        // 1ms over at 100 cents/hour still bills one cent
        assert_eq!(overtime_charge(1, 100), 1);
        // 90 minutes at 100/h → 150, not 149
        assert_eq!(overtime_charge(90 * MS_PER_MINUTE, 100), 150);
    }

    #[test]
    fn overtime_charge_zero_when_on_time() {
        assert_eq!(overtime_charge(0, 600), 0);
        assert_eq!(overtime_charge(-5 * MS_PER_MINUTE, 600), 0);
    }

    #[test]
    fn commission_amount_basis_points() {
        // 100.00 at 10% → 10.00, at 5% → 5.00
        assert_eq!(commission_amount(10_000, 1_000), 1_000);
        assert_eq!(commission_amount(10_000, 500), 500);
        // odd amounts floor
        assert_eq!(commission_amount(999, 1_000), 99);
    }

    #[test]
    fn payment_occupied_credit() {
        let mut p = Payment::new(Ulid::new(), Ulid::new(), 1_000, 0, 1_000);
        p.refunds.push(Refund {
            id: Ulid::new(),
            amount: 300,
            status: RefundStatus::Pending,
            requested_at: 0,
        });
        p.refunds.push(Refund {
            id: Ulid::new(),
            amount: 200,
            status: RefundStatus::Rejected,
            requested_at: 0,
        });
        p.refunds.push(Refund {
            id: Ulid::new(),
            amount: 100,
            status: RefundStatus::Success,
            requested_at: 0,
        });
        // Rejected refund releases its credit
        assert_eq!(p.occupied(), 400);
        assert_eq!(p.refundable(), 600);
    }

    #[test]
    fn rental_status_classes() {
        assert!(RentalStatus::Completed.is_terminal());
        assert!(RentalStatus::Cancelled.is_terminal());
        assert!(!RentalStatus::Returned.is_terminal());

        assert!(RentalStatus::Pending.is_active());
        assert!(RentalStatus::Overdue.is_active());
        assert!(!RentalStatus::Returned.is_active());
        assert!(!RentalStatus::Completed.is_active());
    }

    #[test]
    fn rental_order_amount_includes_overtime() {
        let mut r = Rental::new(
            Ulid::new(),
            Ulid::new(),
            Ulid::new(),
            Ulid::new(),
            MS_PER_HOUR,
            Pricing {
                fee: 500,
                deposit: 2_000,
                overtime_rate: 600,
            },
            0,
        );
        assert_eq!(r.order_amount(), 500);
        r.overtime_fee = 300;
        assert_eq!(r.order_amount(), 800);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RentalCreated {
            id: Ulid::new(),
            order_id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: Ulid::new(),
            duration_ms: 2 * MS_PER_HOUR,
            pricing: Pricing {
                fee: 500,
                deposit: 2_000,
                overtime_rate: 600,
            },
            created_at: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
