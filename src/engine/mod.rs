mod devices;
mod error;
mod payments;
mod queries;
mod rentals;
mod settlement;

pub use error::EngineError;
pub use queries::{DeviceAccounting, RentalFilter};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::registry::Registry;
use crate::wal::Wal;

pub type SharedRental = Arc<RwLock<Rental>>;
pub type SharedDevice = Arc<RwLock<Device>>;
pub type SharedPayment = Arc<RwLock<Payment>>;
pub type SharedCommission = Arc<RwLock<Commission>>;
pub type SharedEarning = Arc<RwLock<MerchantEarning>>;

/// When the slot reservation held by a rental is given back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReleasePolicy {
    /// Released by `complete` — a return stays auditable before the slot
    /// becomes bookable again.
    OnComplete,
    /// Released by `return_rental` — capacity frees as soon as the device
    /// is back.
    OnReturn,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub slot_release: SlotReleasePolicy,
    /// Permit a user to hold more than one active rental at a time.
    pub allow_concurrent_rentals: bool,
    /// Deadline for any single payment-gateway call; elapsed is failure.
    pub gateway_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_release: SlotReleasePolicy::OnComplete,
            allow_concurrent_rentals: false,
            gateway_timeout: Duration::from_secs(10),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Event application ────────────────────────────────────

/// Apply a rental event to a locked rental (and, for slot-moving events,
/// its locked device). The single source of transition semantics for both
/// the live path and startup replay.
pub(super) fn apply_rental_event(rental: &mut Rental, device: Option<&mut Device>, event: &Event) {
    match event {
        Event::RentalPaid { .. } => rental.status = RentalStatus::Paid,
        Event::RentalUnlocked {
            unlocked_at,
            expected_return_at,
            ..
        } => {
            rental.status = RentalStatus::InUse;
            rental.unlocked_at = Some(*unlocked_at);
            rental.expected_return_at = Some(*expected_return_at);
        }
        Event::RentalOverdue { .. } => rental.status = RentalStatus::Overdue,
        Event::RentalReturned {
            returned_at,
            overtime_fee,
            slot_released,
            ..
        } => {
            rental.status = RentalStatus::Returned;
            rental.returned_at = Some(*returned_at);
            rental.overtime_fee = *overtime_fee;
            if *slot_released && !rental.slot_released {
                rental.slot_released = true;
                if let Some(dev) = device {
                    devices::release_slot(dev);
                }
            }
        }
        Event::RentalCompleted { completed_at, .. } => {
            rental.status = RentalStatus::Completed;
            rental.completed_at = Some(*completed_at);
            if !rental.slot_released {
                rental.slot_released = true;
                if let Some(dev) = device {
                    devices::release_slot(dev);
                }
            }
        }
        Event::RentalCancelled { reason, .. } => {
            rental.status = RentalStatus::Cancelled;
            rental.cancel_reason = Some(*reason);
            if !rental.slot_released {
                rental.slot_released = true;
                if let Some(dev) = device {
                    devices::release_slot(dev);
                }
            }
        }
        _ => {}
    }
}

pub(super) fn apply_payment_event(payment: &mut Payment, event: &Event) {
    match event {
        Event::PaymentSucceeded { .. } => payment.status = PaymentStatus::Success,
        Event::PaymentFailed { .. } => payment.status = PaymentStatus::Failed,
        Event::PaymentExpired { .. } => payment.status = PaymentStatus::Expired,
        Event::RefundRequested {
            id,
            amount,
            requested_at,
            ..
        } => payment.refunds.push(Refund {
            id: *id,
            amount: *amount,
            status: RefundStatus::Pending,
            requested_at: *requested_at,
        }),
        Event::RefundApproved { id, .. } => set_refund_status(payment, *id, RefundStatus::Approved),
        Event::RefundRejected { id, .. } => set_refund_status(payment, *id, RefundStatus::Rejected),
        Event::RefundProcessing { id, .. } => {
            set_refund_status(payment, *id, RefundStatus::Processing)
        }
        Event::RefundSucceeded { id, .. } => set_refund_status(payment, *id, RefundStatus::Success),
        Event::RefundFailed { id, .. } => set_refund_status(payment, *id, RefundStatus::Failed),
        _ => {}
    }
}

fn set_refund_status(payment: &mut Payment, id: Ulid, status: RefundStatus) {
    if let Some(refund) = payment.refund_mut(id) {
        refund.status = status;
    }
}

pub(super) fn apply_commission_event(commission: &mut Commission, event: &Event) {
    match event {
        Event::CommissionCancelled { .. } => commission.status = AccrualStatus::Cancelled,
        Event::CommissionSettled { settlement_id, .. } => {
            commission.status = AccrualStatus::Settled;
            commission.settlement_id = Some(*settlement_id);
        }
        _ => {}
    }
}

pub(super) fn apply_earning_event(earning: &mut MerchantEarning, event: &Event) {
    match event {
        Event::MerchantFeeCancelled { .. } => earning.status = AccrualStatus::Cancelled,
        Event::MerchantFeeSettled { settlement_id, .. } => {
            earning.status = AccrualStatus::Settled;
            earning.settlement_id = Some(*settlement_id);
        }
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) registry: Arc<dyn Registry>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub notify: Arc<NotifyHub>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,

    pub(super) devices: DashMap<Ulid, SharedDevice>,
    pub(super) rentals: DashMap<Ulid, SharedRental>,
    pub(super) payments: DashMap<Ulid, SharedPayment>,
    pub(super) commissions: DashMap<Ulid, SharedCommission>,
    pub(super) merchant_earnings: DashMap<Ulid, SharedEarning>,
    pub(super) settlements: DashMap<Ulid, Settlement>,

    /// order → its rental (one reservation cycle per order)
    pub(super) rental_by_order: DashMap<Ulid, Ulid>,
    /// user → rentals still in an active status
    pub(super) active_by_user: DashMap<Ulid, Vec<Ulid>>,
    /// device → every rental ever created on it
    pub(super) rentals_by_device: DashMap<Ulid, Vec<Ulid>>,
    pub(super) commissions_by_order: DashMap<Ulid, Vec<Ulid>>,
    pub(super) earnings_by_order: DashMap<Ulid, Vec<Ulid>>,
    /// Admission guard: at most one settlement per (kind, target, period).
    pub(super) settlement_periods: DashMap<(SettlementKind, Ulid, Ms, Ms), Ulid>,
    /// Serializes creates per user so the one-active-rental rule holds.
    pub(super) user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        registry: Arc<dyn Registry>,
        gateway: Arc<dyn PaymentGateway>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            registry,
            gateway,
            notify,
            wal_tx,
            devices: DashMap::new(),
            rentals: DashMap::new(),
            payments: DashMap::new(),
            commissions: DashMap::new(),
            merchant_earnings: DashMap::new(),
            settlements: DashMap::new(),
            rental_by_order: DashMap::new(),
            active_by_user: DashMap::new(),
            rentals_by_device: DashMap::new(),
            commissions_by_order: DashMap::new(),
            earnings_by_order: DashMap::new(),
            settlement_periods: DashMap::new(),
            user_locks: DashMap::new(),
        };

        // Replay — we're the sole owner of every Arc here, so try_read/
        // try_write always succeed instantly. Never use blocking_read/
        // blocking_write: this may run inside an async context.
        for event in &events {
            engine.apply_replayed(event);
        }

        Ok(engine)
    }

    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::DeviceRegistered { id, slot_count } => {
                self.devices
                    .insert(*id, Arc::new(RwLock::new(Device::new(*id, *slot_count))));
            }
            Event::RentalCreated {
                id,
                order_id,
                user_id,
                device_id,
                duration_ms,
                pricing,
                created_at,
            } => {
                if let Some(dev) = self.devices.get(device_id) {
                    let mut guard = dev.try_write().expect("replay: uncontended write");
                    let reserved = devices::reserve_slot(&mut guard);
                    debug_assert!(reserved, "replay: slot ledger out of balance");
                }
                let rental = Rental::new(
                    *id, *order_id, *user_id, *device_id, *duration_ms, *pricing, *created_at,
                );
                self.rentals.insert(*id, Arc::new(RwLock::new(rental)));
                self.rental_by_order.insert(*order_id, *id);
                self.active_by_user.entry(*user_id).or_default().push(*id);
                self.rentals_by_device
                    .entry(*device_id)
                    .or_default()
                    .push(*id);
            }
            Event::RentalPaid { id }
            | Event::RentalUnlocked { id, .. }
            | Event::RentalOverdue { id }
            | Event::RentalReturned { id, .. }
            | Event::RentalCompleted { id, .. }
            | Event::RentalCancelled { id, .. } => {
                let Some(rental) = self.rentals.get(id).map(|e| e.value().clone()) else {
                    return;
                };
                let mut guard = rental.try_write().expect("replay: uncontended write");
                let device = self.devices.get(&guard.device_id).map(|e| e.value().clone());
                let mut dev_guard =
                    device.as_ref().map(|d| d.try_write().expect("replay: uncontended write"));
                apply_rental_event(&mut guard, dev_guard.as_deref_mut(), event);
                if !guard.status.is_active() {
                    let user_id = guard.user_id;
                    drop(guard);
                    drop(dev_guard);
                    self.finish_active(user_id, *id);
                }
            }
            Event::PaymentRecorded {
                id,
                order_id,
                amount,
                created_at,
                expires_at,
            } => {
                let payment = Payment::new(*id, *order_id, *amount, *created_at, *expires_at);
                self.payments.insert(*id, Arc::new(RwLock::new(payment)));
            }
            Event::PaymentSucceeded { id }
            | Event::PaymentFailed { id }
            | Event::PaymentExpired { id } => {
                if let Some(payment) = self.payments.get(id).map(|e| e.value().clone()) {
                    let mut guard = payment.try_write().expect("replay: uncontended write");
                    apply_payment_event(&mut guard, event);
                }
            }
            Event::RefundRequested { payment_id, .. }
            | Event::RefundApproved { payment_id, .. }
            | Event::RefundRejected { payment_id, .. }
            | Event::RefundProcessing { payment_id, .. }
            | Event::RefundSucceeded { payment_id, .. }
            | Event::RefundFailed { payment_id, .. } => {
                if let Some(payment) = self.payments.get(payment_id).map(|e| e.value().clone()) {
                    let mut guard = payment.try_write().expect("replay: uncontended write");
                    apply_payment_event(&mut guard, event);
                }
            }
            Event::CommissionAccrued {
                id,
                order_id,
                distributor_id,
                level,
                amount,
                accrued_at,
            } => {
                let commission = Commission {
                    id: *id,
                    order_id: *order_id,
                    distributor_id: *distributor_id,
                    level: *level,
                    amount: *amount,
                    status: AccrualStatus::Pending,
                    accrued_at: *accrued_at,
                    settlement_id: None,
                };
                self.commissions
                    .insert(*id, Arc::new(RwLock::new(commission)));
                self.commissions_by_order
                    .entry(*order_id)
                    .or_default()
                    .push(*id);
            }
            Event::CommissionCancelled { id } | Event::CommissionSettled { id, .. } => {
                if let Some(commission) = self.commissions.get(id).map(|e| e.value().clone()) {
                    let mut guard = commission.try_write().expect("replay: uncontended write");
                    apply_commission_event(&mut guard, event);
                }
            }
            Event::MerchantFeeAccrued {
                id,
                order_id,
                merchant_id,
                amount,
                accrued_at,
            } => {
                let earning = MerchantEarning {
                    id: *id,
                    order_id: *order_id,
                    merchant_id: *merchant_id,
                    amount: *amount,
                    status: AccrualStatus::Pending,
                    accrued_at: *accrued_at,
                    settlement_id: None,
                };
                self.merchant_earnings
                    .insert(*id, Arc::new(RwLock::new(earning)));
                self.earnings_by_order
                    .entry(*order_id)
                    .or_default()
                    .push(*id);
            }
            Event::MerchantFeeCancelled { id } | Event::MerchantFeeSettled { id, .. } => {
                if let Some(earning) = self.merchant_earnings.get(id).map(|e| e.value().clone()) {
                    let mut guard = earning.try_write().expect("replay: uncontended write");
                    apply_earning_event(&mut guard, event);
                }
            }
            Event::SettlementCreated {
                id,
                kind,
                target_id,
                period_start,
                period_end,
                total_amount,
                entry_count,
                created_at,
            } => {
                self.settlements.insert(
                    *id,
                    Settlement {
                        id: *id,
                        kind: *kind,
                        target_id: *target_id,
                        period_start: *period_start,
                        period_end: *period_end,
                        total_amount: *total_amount,
                        entry_count: *entry_count,
                        created_at: *created_at,
                    },
                );
                self.settlement_periods
                    .insert((*kind, *target_id, *period_start, *period_end), *id);
            }
        }
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_rental(&self, id: &Ulid) -> Option<SharedRental> {
        self.rentals.get(id).map(|e| e.value().clone())
    }

    pub fn get_device(&self, id: &Ulid) -> Option<SharedDevice> {
        self.devices.get(id).map(|e| e.value().clone())
    }

    pub fn get_payment(&self, id: &Ulid) -> Option<SharedPayment> {
        self.payments.get(id).map(|e| e.value().clone())
    }

    pub fn rental_for_order(&self, order_id: &Ulid) -> Option<Ulid> {
        self.rental_by_order.get(order_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, for the single-rental
    /// transition paths.
    pub(super) async fn persist_rental_event(
        &self,
        rental: &mut Rental,
        device: Option<&mut Device>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_rental_event(rental, device, event);
        self.notify.send(rental.device_id, event);
        Ok(())
    }

    pub(super) fn finish_active(&self, user_id: Ulid, rental_id: Ulid) {
        if let Some(mut active) = self.active_by_user.get_mut(&user_id) {
            active.retain(|r| r != &rental_id);
        }
    }

    /// Minimal event set that recreates the current state on replay.
    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        for entry in self.devices.iter() {
            let d = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::DeviceRegistered {
                id: d.id,
                slot_count: d.slot_count,
            });
        }

        for entry in self.rentals.iter() {
            let r = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::RentalCreated {
                id: r.id,
                order_id: r.order_id,
                user_id: r.user_id,
                device_id: r.device_id,
                duration_ms: r.duration_ms,
                pricing: Pricing {
                    fee: r.fee,
                    deposit: r.deposit,
                    overtime_rate: r.overtime_rate,
                },
                created_at: r.created_at,
            });
            match r.status {
                RentalStatus::Pending => {}
                RentalStatus::Cancelled => events.push(Event::RentalCancelled {
                    id: r.id,
                    reason: r.cancel_reason.unwrap_or(CancelReason::UserRequest),
                }),
                _ => {
                    events.push(Event::RentalPaid { id: r.id });
                    if let (Some(unlocked_at), Some(expected_return_at)) =
                        (r.unlocked_at, r.expected_return_at)
                    {
                        events.push(Event::RentalUnlocked {
                            id: r.id,
                            unlocked_at,
                            expected_return_at,
                        });
                    }
                    if r.status == RentalStatus::Overdue {
                        events.push(Event::RentalOverdue { id: r.id });
                    }
                    if matches!(r.status, RentalStatus::Returned | RentalStatus::Completed) {
                        events.push(Event::RentalReturned {
                            id: r.id,
                            returned_at: r.returned_at.unwrap_or(r.created_at),
                            overtime_fee: r.overtime_fee,
                            slot_released: r.slot_released && r.status == RentalStatus::Returned,
                        });
                    }
                    if r.status == RentalStatus::Completed {
                        events.push(Event::RentalCompleted {
                            id: r.id,
                            completed_at: r.completed_at.unwrap_or(r.created_at),
                        });
                    }
                }
            }
        }

        for entry in self.payments.iter() {
            let p = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::PaymentRecorded {
                id: p.id,
                order_id: p.order_id,
                amount: p.amount,
                created_at: p.created_at,
                expires_at: p.expires_at,
            });
            match p.status {
                PaymentStatus::Pending => {}
                PaymentStatus::Success => events.push(Event::PaymentSucceeded { id: p.id }),
                PaymentStatus::Failed => events.push(Event::PaymentFailed { id: p.id }),
                PaymentStatus::Expired => events.push(Event::PaymentExpired { id: p.id }),
            }
            for refund in &p.refunds {
                events.push(Event::RefundRequested {
                    id: refund.id,
                    payment_id: p.id,
                    amount: refund.amount,
                    requested_at: refund.requested_at,
                });
                let status_event = match refund.status {
                    RefundStatus::Pending => None,
                    RefundStatus::Approved => Some(Event::RefundApproved {
                        id: refund.id,
                        payment_id: p.id,
                    }),
                    RefundStatus::Rejected => Some(Event::RefundRejected {
                        id: refund.id,
                        payment_id: p.id,
                    }),
                    RefundStatus::Processing => Some(Event::RefundProcessing {
                        id: refund.id,
                        payment_id: p.id,
                    }),
                    RefundStatus::Success => Some(Event::RefundSucceeded {
                        id: refund.id,
                        payment_id: p.id,
                    }),
                    RefundStatus::Failed => Some(Event::RefundFailed {
                        id: refund.id,
                        payment_id: p.id,
                    }),
                };
                events.extend(status_event);
            }
        }

        for entry in self.commissions.iter() {
            let c = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::CommissionAccrued {
                id: c.id,
                order_id: c.order_id,
                distributor_id: c.distributor_id,
                level: c.level,
                amount: c.amount,
                accrued_at: c.accrued_at,
            });
            match (c.status, c.settlement_id) {
                (AccrualStatus::Cancelled, _) => {
                    events.push(Event::CommissionCancelled { id: c.id })
                }
                (AccrualStatus::Settled, Some(settlement_id)) => {
                    events.push(Event::CommissionSettled {
                        id: c.id,
                        settlement_id,
                    })
                }
                _ => {}
            }
        }

        for entry in self.merchant_earnings.iter() {
            let e = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::MerchantFeeAccrued {
                id: e.id,
                order_id: e.order_id,
                merchant_id: e.merchant_id,
                amount: e.amount,
                accrued_at: e.accrued_at,
            });
            match (e.status, e.settlement_id) {
                (AccrualStatus::Cancelled, _) => {
                    events.push(Event::MerchantFeeCancelled { id: e.id })
                }
                (AccrualStatus::Settled, Some(settlement_id)) => {
                    events.push(Event::MerchantFeeSettled {
                        id: e.id,
                        settlement_id,
                    })
                }
                _ => {}
            }
        }

        for entry in self.settlements.iter() {
            let s = entry.value();
            events.push(Event::SettlementCreated {
                id: s.id,
                kind: s.kind,
                target_id: s.target_id,
                period_start: s.period_start,
                period_end: s.period_end,
                total_amount: s.total_amount,
                entry_count: s.entry_count,
                created_at: s.created_at,
            });
        }

        events
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
