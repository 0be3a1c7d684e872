use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{apply_payment_event, Engine, EngineError};

use std::sync::Arc;

use tokio::sync::RwLock;

/// Payment/refund ledger. Each payment owns its refunds, so the payment's
/// write lock is the row lock for every monetary check-then-write on that
/// order — including the occupied-credit refund cap and confirmation racing
/// a refund.
impl Engine {
    pub async fn record_payment(
        &self,
        id: Ulid,
        order_id: Ulid,
        amount: Cents,
        now: Ms,
        expires_at: Ms,
    ) -> Result<(), EngineError> {
        if amount <= 0 {
            return Err(EngineError::LimitExceeded("payment amount must be positive"));
        }
        if self.payments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::PaymentRecorded {
            id,
            order_id,
            amount,
            created_at: now,
            expires_at,
        };
        self.wal_append(&event).await?;
        self.payments.insert(
            id,
            Arc::new(RwLock::new(Payment::new(id, order_id, amount, now, expires_at))),
        );
        Ok(())
    }

    /// Provider reported success. Settles the payment and drives the
    /// order's rental to `Paid`. A confirmation arriving after the expiry
    /// deadline closes the payment instead.
    pub async fn confirm_payment(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let payment = self.get_payment(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = payment.write().await;
        match guard.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Success => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }
        if now >= guard.expires_at {
            let event = Event::PaymentExpired { id };
            self.wal_append(&event).await?;
            apply_payment_event(&mut guard, &event);
            return Err(EngineError::PreconditionFailed {
                id,
                state: PaymentStatus::Expired.as_str(),
            });
        }

        let event = Event::PaymentSucceeded { id };
        self.wal_append(&event).await?;
        apply_payment_event(&mut guard, &event);
        let order_id = guard.order_id;
        drop(guard);

        if let Some(rental_id) = self.rental_for_order(&order_id) {
            match self.mark_paid(rental_id).await {
                Ok(()) => {}
                Err(e) if e.is_precondition() => {
                    // Payment landed on a rental that moved on (e.g. the
                    // expiry sweep won). The money is recorded; follow-up
                    // is a refund, not a rollback.
                    tracing::warn!("payment {id} confirmed but rental {rental_id} not payable: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Provider reported failure. Fails the payment and cancels the
    /// order's rental if it is still waiting on this payment.
    pub async fn fail_payment(&self, id: Ulid) -> Result<(), EngineError> {
        let payment = self.get_payment(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = payment.write().await;
        match guard.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Failed => return Ok(()),
            status => {
                return Err(EngineError::PreconditionFailed {
                    id,
                    state: status.as_str(),
                })
            }
        }
        let event = Event::PaymentFailed { id };
        self.wal_append(&event).await?;
        apply_payment_event(&mut guard, &event);
        let order_id = guard.order_id;
        drop(guard);

        if let Some(rental_id) = self.rental_for_order(&order_id) {
            match self.cancel(rental_id, CancelReason::PaymentFailed).await {
                Ok(()) => {}
                Err(e) if e.is_precondition() => {
                    tracing::debug!("rental {rental_id} already past cancellation: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close stale pending payments. Returns how many were closed; each
    /// record is handled independently so one failure doesn't block the
    /// batch.
    pub async fn close_expired_payments(&self, before: Ms, limit: usize) -> usize {
        let mut candidates = Vec::new();
        for entry in self.payments.iter() {
            if candidates.len() >= limit {
                break;
            }
            if let Ok(p) = entry.value().try_read()
                && p.status == PaymentStatus::Pending
                && p.expires_at <= before
            {
                candidates.push(p.id);
            }
        }

        let mut closed = 0;
        for id in candidates {
            match self.expire_payment(id).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("failed to expire payment {id}: {e}"),
            }
        }
        closed
    }

    async fn expire_payment(&self, id: Ulid) -> Result<bool, EngineError> {
        let payment = self.get_payment(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = payment.write().await;
        if guard.status != PaymentStatus::Pending {
            return Ok(false);
        }
        let event = Event::PaymentExpired { id };
        self.wal_append(&event).await?;
        apply_payment_event(&mut guard, &event);
        Ok(true)
    }

    /// Reserve refund credit on a settled payment. The cap check and the
    /// insert happen under one lock acquisition: credit is occupied the
    /// instant the refund exists, so concurrent requests can never
    /// oversubscribe the payment.
    pub async fn request_refund(
        &self,
        payment_id: Ulid,
        refund_id: Ulid,
        amount: Cents,
        now: Ms,
    ) -> Result<(), EngineError> {
        if amount <= 0 {
            return Err(EngineError::LimitExceeded("refund amount must be positive"));
        }
        let payment = self
            .get_payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;
        let mut guard = payment.write().await;
        if guard.refunds.iter().any(|r| r.id == refund_id) {
            return Ok(());
        }
        if guard.status != PaymentStatus::Success {
            return Err(EngineError::PaymentNotSettled(payment_id));
        }
        let refundable = guard.refundable();
        if amount > refundable {
            metrics::counter!(observability::REFUND_OVER_CAP_TOTAL).increment(1);
            return Err(EngineError::RefundExceedsPayment {
                requested: amount,
                refundable,
            });
        }

        let event = Event::RefundRequested {
            id: refund_id,
            payment_id,
            amount,
            requested_at: now,
        };
        self.wal_append(&event).await?;
        apply_payment_event(&mut guard, &event);
        Ok(())
    }

    pub async fn approve_refund(&self, payment_id: Ulid, refund_id: Ulid) -> Result<(), EngineError> {
        self.step_refund(
            payment_id,
            refund_id,
            RefundStatus::Approved,
            Event::RefundApproved {
                id: refund_id,
                payment_id,
            },
        )
        .await
    }

    /// Rejecting releases the occupied credit.
    pub async fn reject_refund(&self, payment_id: Ulid, refund_id: Ulid) -> Result<(), EngineError> {
        self.step_refund(
            payment_id,
            refund_id,
            RefundStatus::Rejected,
            Event::RefundRejected {
                id: refund_id,
                payment_id,
            },
        )
        .await
    }

    async fn step_refund(
        &self,
        payment_id: Ulid,
        refund_id: Ulid,
        target: RefundStatus,
        event: Event,
    ) -> Result<(), EngineError> {
        let payment = self
            .get_payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;
        let mut guard = payment.write().await;
        let refund = guard
            .refunds
            .iter()
            .find(|r| r.id == refund_id)
            .ok_or(EngineError::NotFound(refund_id))?;
        if refund.status == target {
            return Ok(());
        }
        if refund.status != RefundStatus::Pending {
            return Err(EngineError::PreconditionFailed {
                id: refund_id,
                state: refund.status.as_str(),
            });
        }
        self.wal_append(&event).await?;
        apply_payment_event(&mut guard, &event);
        Ok(())
    }

    /// Push an approved refund through the gateway. The call runs outside
    /// any lock, bounded by the configured deadline; an elapsed timeout is
    /// a failure, never indefinitely pending. On success the order's
    /// pending accruals are cancelled.
    pub async fn execute_refund(&self, payment_id: Ulid, refund_id: Ulid) -> Result<(), EngineError> {
        let payment = self
            .get_payment(&payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;

        let (amount, order_id) = {
            let mut guard = payment.write().await;
            let order_id = guard.order_id;
            let refund = guard
                .refunds
                .iter()
                .find(|r| r.id == refund_id)
                .ok_or(EngineError::NotFound(refund_id))?;
            let amount = refund.amount;
            match refund.status {
                RefundStatus::Approved => {
                    let event = Event::RefundProcessing {
                        id: refund_id,
                        payment_id,
                    };
                    self.wal_append(&event).await?;
                    apply_payment_event(&mut guard, &event);
                }
                // Re-drive after a crash mid-processing.
                RefundStatus::Processing => {}
                RefundStatus::Success => return Ok(()),
                status => {
                    return Err(EngineError::PreconditionFailed {
                        id: refund_id,
                        state: status.as_str(),
                    })
                }
            }
            (amount, order_id)
        };

        let call = self.gateway.execute_refund(refund_id, amount);
        let outcome = tokio::time::timeout(self.config.gateway_timeout, call).await;

        let mut guard = payment.write().await;
        match outcome {
            Ok(Ok(())) => {
                let event = Event::RefundSucceeded {
                    id: refund_id,
                    payment_id,
                };
                self.wal_append(&event).await?;
                apply_payment_event(&mut guard, &event);
                drop(guard);
                self.cancel_pending_accruals(order_id).await?;
                Ok(())
            }
            Ok(Err(e)) => {
                let event = Event::RefundFailed {
                    id: refund_id,
                    payment_id,
                };
                self.wal_append(&event).await?;
                apply_payment_event(&mut guard, &event);
                Err(EngineError::GatewayFailure(e.to_string()))
            }
            Err(_) => {
                let event = Event::RefundFailed {
                    id: refund_id,
                    payment_id,
                };
                self.wal_append(&event).await?;
                apply_payment_event(&mut guard, &event);
                Err(EngineError::GatewayFailure("refund call timed out".into()))
            }
        }
    }
}
