use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{apply_commission_event, apply_earning_event, Engine, EngineError};

trait SettleEntry: Send + Sync {
    fn entry_id(&self) -> Ulid;
    fn amount(&self) -> Cents;
    fn status(&self) -> AccrualStatus;
}

impl SettleEntry for Commission {
    fn entry_id(&self) -> Ulid {
        self.id
    }
    fn amount(&self) -> Cents {
        self.amount
    }
    fn status(&self) -> AccrualStatus {
        self.status
    }
}

impl SettleEntry for MerchantEarning {
    fn entry_id(&self) -> Ulid {
        self.id
    }
    fn amount(&self) -> Cents {
        self.amount
    }
    fn status(&self) -> AccrualStatus {
        self.status
    }
}

/// Commission/merchant accrual on order completion, refund-driven
/// cancellation, and the period settlement batch.
impl Engine {
    /// Accrue one commission per referral level plus the merchant's
    /// remainder for a completing rental. Deduplicated per (order, target)
    /// so a retried completion never double-accrues.
    pub(super) async fn accrue_order(&self, rental: &Rental, now: Ms) -> Result<(), EngineError> {
        let order_id = rental.order_id;
        let order_amount = rental.order_amount();

        for referral in self.registry.referral_chain(rental.user_id) {
            if self
                .order_commission_for(order_id, referral.distributor_id)
                .await
                .is_some()
            {
                continue;
            }
            let amount = commission_amount(order_amount, referral.rate_bps);
            let id = Ulid::new();
            let event = Event::CommissionAccrued {
                id,
                order_id,
                distributor_id: referral.distributor_id,
                level: referral.level,
                amount,
                accrued_at: now,
            };
            self.wal_append(&event).await?;
            self.commissions.insert(
                id,
                Arc::new(RwLock::new(Commission {
                    id,
                    order_id,
                    distributor_id: referral.distributor_id,
                    level: referral.level,
                    amount,
                    status: AccrualStatus::Pending,
                    accrued_at: now,
                    settlement_id: None,
                })),
            );
            self.commissions_by_order.entry(order_id).or_default().push(id);
        }

        if let Some(merchant_id) = self.registry.merchant_for_device(rental.device_id)
            && !self.order_has_earning(order_id)
        {
            let amount = order_amount - self.order_commission_total(order_id).await;
            let id = Ulid::new();
            let event = Event::MerchantFeeAccrued {
                id,
                order_id,
                merchant_id,
                amount,
                accrued_at: now,
            };
            self.wal_append(&event).await?;
            self.merchant_earnings.insert(
                id,
                Arc::new(RwLock::new(MerchantEarning {
                    id,
                    order_id,
                    merchant_id,
                    amount,
                    status: AccrualStatus::Pending,
                    accrued_at: now,
                    settlement_id: None,
                })),
            );
            self.earnings_by_order.entry(order_id).or_default().push(id);
        }

        Ok(())
    }

    async fn order_commission_for(&self, order_id: Ulid, distributor_id: Ulid) -> Option<Ulid> {
        let ids = self
            .commissions_by_order
            .get(&order_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(commission) = self.commissions.get(&id).map(|e| e.value().clone())
                && commission.read().await.distributor_id == distributor_id
            {
                return Some(id);
            }
        }
        None
    }

    async fn order_commission_total(&self, order_id: Ulid) -> Cents {
        let ids = self
            .commissions_by_order
            .get(&order_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut total = 0;
        for id in ids {
            if let Some(commission) = self.commissions.get(&id).map(|e| e.value().clone()) {
                total += commission.read().await.amount;
            }
        }
        total
    }

    fn order_has_earning(&self, order_id: Ulid) -> bool {
        self.earnings_by_order
            .get(&order_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// A refund landed on this order: cancel whatever is still pending.
    /// Settled entries stay settled — there is no automatic clawback.
    pub(super) async fn cancel_pending_accruals(&self, order_id: Ulid) -> Result<(), EngineError> {
        let commission_ids = self
            .commissions_by_order
            .get(&order_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        for id in commission_ids {
            let Some(arc) = self.commissions.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let mut guard = arc.write().await;
            match guard.status {
                AccrualStatus::Pending => {
                    let event = Event::CommissionCancelled { id };
                    self.wal_append(&event).await?;
                    apply_commission_event(&mut guard, &event);
                }
                AccrualStatus::Settled => {
                    tracing::warn!(
                        "commission {id} on refunded order {order_id} already settled; left in place"
                    );
                }
                AccrualStatus::Cancelled => {}
            }
        }

        let earning_ids = self
            .earnings_by_order
            .get(&order_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        for id in earning_ids {
            let Some(arc) = self.merchant_earnings.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let mut guard = arc.write().await;
            match guard.status {
                AccrualStatus::Pending => {
                    let event = Event::MerchantFeeCancelled { id };
                    self.wal_append(&event).await?;
                    apply_earning_event(&mut guard, &event);
                }
                AccrualStatus::Settled => {
                    tracing::warn!(
                        "merchant earning {id} on refunded order {order_id} already settled; left in place"
                    );
                }
                AccrualStatus::Cancelled => {}
            }
        }

        Ok(())
    }

    /// Batch every still-pending entry accrued before `period_end` into one
    /// settlement per target. The `(kind, target, period)` guard makes a
    /// repeat invocation a no-op, so the batching loop can re-run freely.
    /// Returns the settlements created.
    pub async fn run_settlement(
        &self,
        kind: SettlementKind,
        period_start: Ms,
        period_end: Ms,
        now: Ms,
    ) -> Result<Vec<Ulid>, EngineError> {
        if period_start >= period_end {
            return Err(EngineError::LimitExceeded("empty settlement period"));
        }

        let mut by_target: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        match kind {
            SettlementKind::Distributor => {
                for entry in self.commissions.iter() {
                    if let Ok(c) = entry.value().try_read()
                        && c.status == AccrualStatus::Pending
                        && c.accrued_at < period_end
                    {
                        by_target.entry(c.distributor_id).or_default().push(c.id);
                    }
                }
            }
            SettlementKind::Merchant => {
                for entry in self.merchant_earnings.iter() {
                    if let Ok(e) = entry.value().try_read()
                        && e.status == AccrualStatus::Pending
                        && e.accrued_at < period_end
                    {
                        by_target.entry(e.merchant_id).or_default().push(e.id);
                    }
                }
            }
        }

        let mut created = Vec::new();
        for (target, entry_ids) in by_target {
            let result = match kind {
                SettlementKind::Distributor => {
                    self.settle_target(
                        &self.commissions,
                        |id, settlement_id| Event::CommissionSettled { id, settlement_id },
                        apply_commission_event,
                        kind,
                        target,
                        period_start,
                        period_end,
                        &entry_ids,
                        now,
                    )
                    .await
                }
                SettlementKind::Merchant => {
                    self.settle_target(
                        &self.merchant_earnings,
                        |id, settlement_id| Event::MerchantFeeSettled { id, settlement_id },
                        apply_earning_event,
                        kind,
                        target,
                        period_start,
                        period_end,
                        &entry_ids,
                        now,
                    )
                    .await
                }
            };
            match result {
                Ok(Some(settlement_id)) => created.push(settlement_id),
                Ok(None) => {}
                // One target's failure never blocks the others.
                Err(e) => tracing::warn!("settlement for target {target} failed: {e}"),
            }
        }
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_target<E: SettleEntry>(
        &self,
        entries: &DashMap<Ulid, Arc<RwLock<E>>>,
        settled_event: fn(Ulid, Ulid) -> Event,
        apply: fn(&mut E, &Event),
        kind: SettlementKind,
        target: Ulid,
        period_start: Ms,
        period_end: Ms,
        entry_ids: &[Ulid],
        now: Ms,
    ) -> Result<Option<Ulid>, EngineError> {
        let key = (kind, target, period_start, period_end);
        if self.settlement_periods.contains_key(&key) {
            return Ok(None);
        }

        // Lock the candidates and drop any that moved on since the scan.
        let mut guards = Vec::new();
        for id in entry_ids {
            if let Some(arc) = entries.get(id).map(|e| e.value().clone()) {
                let guard = arc.write_owned().await;
                if guard.status() == AccrualStatus::Pending {
                    guards.push(guard);
                }
            }
        }
        if guards.is_empty() {
            return Ok(None);
        }

        // Claim the period before journaling; undo the claim if the journal
        // write fails so a retry can take it.
        let settlement_id = Ulid::new();
        match self.settlement_periods.entry(key) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(slot) => {
                slot.insert(settlement_id);
            }
        }

        let total_amount: Cents = guards.iter().map(|g| g.amount()).sum();
        let entry_count = guards.len() as u32;
        let event = Event::SettlementCreated {
            id: settlement_id,
            kind,
            target_id: target,
            period_start,
            period_end,
            total_amount,
            entry_count,
            created_at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.settlement_periods.remove(&key);
            return Err(e);
        }
        self.settlements.insert(
            settlement_id,
            Settlement {
                id: settlement_id,
                kind,
                target_id: target,
                period_start,
                period_end,
                total_amount,
                entry_count,
                created_at: now,
            },
        );
        metrics::counter!(observability::SETTLEMENTS_CREATED_TOTAL).increment(1);

        for guard in &mut guards {
            let event = settled_event(guard.entry_id(), settlement_id);
            self.wal_append(&event).await?;
            apply(&mut *guard, &event);
        }

        tracing::info!(
            "settled {entry_count} entries totalling {total_amount} for target {target} \
             over [{period_start}, {period_end})"
        );
        Ok(Some(settlement_id))
    }
}
