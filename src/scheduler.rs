use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{CancelReason, Ms, SettlementKind, MS_PER_DAY};
use crate::observability;

/// Reconciliation knobs.
///
/// - `sweep_interval`: how often the sweeps run.
/// - `pending_payment_grace`: how long an unpaid rental may stay `Pending`
///   before the expiry sweep cancels it.
/// - `return_settle_delay`: how long a `Returned` rental rests (dispute /
///   adjustment window) before auto-completion.
/// - `batch_size`: per-sweep record cap per tick.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sweep_interval: Duration,
    pub pending_payment_grace: Duration,
    pub return_settle_delay: Duration,
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            pending_payment_grace: Duration::from_secs(30 * 60),
            return_settle_delay: Duration::from_secs(5 * 60),
            batch_size: 100,
        }
    }
}

fn unix_now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task driving the reconciliation sweeps on a fixed interval.
pub async fn run_reconciler(engine: Arc<Engine>, config: ReconcilerConfig) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        interval.tick().await;
        run_sweeps(&engine, &config, unix_now_ms()).await;
    }
}

/// One reconciliation pass at `now`. Plain async fn so tests drive a tick
/// synchronously. Each sweep is batch-bounded; each record is handled
/// independently, so a failing record is logged, skipped, and retried on
/// the next tick.
pub async fn run_sweeps(engine: &Engine, config: &ReconcilerConfig, now: Ms) {
    expire_unpaid(engine, config, now).await;
    flag_overdue(engine, config, now).await;
    close_expired_payments(engine, config, now).await;
    autocomplete_returns(engine, config, now).await;
}

/// Rentals that sat `Pending` past the payment grace window are cancelled
/// and their slot freed. The reason-scoped cancel means a rental that won
/// a concurrent payment is skipped, not clawed back.
async fn expire_unpaid(engine: &Engine, config: &ReconcilerConfig, now: Ms) {
    metrics::counter!(observability::SWEEPS_TOTAL, "sweep" => "expire_unpaid").increment(1);
    let cutoff = now - config.pending_payment_grace.as_millis() as Ms;
    for id in engine.pending_created_before(cutoff, config.batch_size) {
        match engine.cancel(id, CancelReason::PaymentTimeout).await {
            Ok(()) => info!("expired unpaid rental {id}"),
            Err(e) if e.is_precondition() => debug!("skip {id}: {e}"),
            Err(e) => {
                metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
                warn!("failed to expire rental {id}: {e}");
            }
        }
    }
}

/// In-use rentals past their expected return are flagged `Overdue`. The
/// slot stays reserved — the device is still out.
async fn flag_overdue(engine: &Engine, config: &ReconcilerConfig, now: Ms) {
    metrics::counter!(observability::SWEEPS_TOTAL, "sweep" => "flag_overdue").increment(1);
    for id in engine.in_use_due_before(now, config.batch_size) {
        match engine.mark_overdue(id).await {
            Ok(()) => {}
            Err(e) if e.is_precondition() => debug!("skip {id}: {e}"),
            Err(e) => {
                metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
                warn!("failed to flag rental {id} overdue: {e}");
            }
        }
    }
}

async fn close_expired_payments(engine: &Engine, config: &ReconcilerConfig, now: Ms) {
    metrics::counter!(observability::SWEEPS_TOTAL, "sweep" => "close_expired_payments")
        .increment(1);
    let closed = engine.close_expired_payments(now, config.batch_size).await;
    if closed > 0 {
        info!("closed {closed} expired payments");
    }
}

/// Returned rentals past the settle delay are completed: slot released (if
/// the policy left it held) and accruals recorded.
async fn autocomplete_returns(engine: &Engine, config: &ReconcilerConfig, now: Ms) {
    metrics::counter!(observability::SWEEPS_TOTAL, "sweep" => "autocomplete_returns").increment(1);
    let cutoff = now - config.return_settle_delay.as_millis() as Ms;
    for id in engine.returned_before(cutoff, config.batch_size) {
        match engine.complete(id, now).await {
            Ok(()) => info!("auto-completed rental {id}"),
            Err(e) if e.is_precondition() => debug!("skip {id}: {e}"),
            Err(e) => {
                metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
                warn!("failed to auto-complete rental {id}: {e}");
            }
        }
    }
}

/// Background task batching pending accruals into settlements for the
/// previous UTC day. The engine's period guard makes every repeat pass a
/// no-op, so the loop can run well above the daily cadence.
pub async fn run_settlement_loop(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = unix_now_ms();
        let period_end = now / MS_PER_DAY * MS_PER_DAY;
        let period_start = period_end - MS_PER_DAY;
        for kind in [SettlementKind::Distributor, SettlementKind::Merchant] {
            match engine.run_settlement(kind, period_start, period_end, now).await {
                Ok(created) if !created.is_empty() => {
                    info!("created {} {kind:?} settlements", created.len());
                }
                Ok(_) => {}
                Err(e) => warn!("settlement batch failed: {e}"),
            }
        }
    }
}

/// Background task compacting the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, RentalFilter};
    use crate::gateway::AcceptAllGateway;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::registry::StaticRegistry;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = MS_PER_HOUR;
    const M: Ms = MS_PER_MINUTE;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rentd_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn test_engine(name: &str) -> Arc<Engine> {
        Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                Arc::new(StaticRegistry::new()),
                Arc::new(AcceptAllGateway),
                EngineConfig::default(),
            )
            .unwrap(),
        )
    }

    fn pricing() -> Pricing {
        Pricing {
            fee: 500,
            deposit: 2_000,
            overtime_rate: 600,
        }
    }

    #[tokio::test]
    async fn sweep_expires_unpaid_rental_and_frees_slot() {
        let engine = test_engine("expire_unpaid.wal");
        let config = ReconcilerConfig::default();
        let device = Ulid::new();
        engine.register_device(device, 1).await.unwrap();

        let rental = Ulid::new();
        let t0 = 1_000_000 * M;
        engine
            .create_rental(rental, Ulid::new(), Ulid::new(), device, H, pricing(), t0)
            .await
            .unwrap();

        // One minute short of the grace window: nothing happens
        run_sweeps(&engine, &config, t0 + 29 * M).await;
        let info = engine.get_rental_info(&rental).unwrap();
        assert_eq!(info.status, RentalStatus::Pending);

        // Past the window: cancelled, slot released
        run_sweeps(&engine, &config, t0 + 31 * M).await;
        let info = engine.get_rental_info(&rental).unwrap();
        assert_eq!(info.status, RentalStatus::Cancelled);
        let acct = engine.device_accounting(&device).unwrap();
        assert_eq!(acct.available_slots, 1);
        assert_eq!(acct.outstanding, 0);
    }

    #[tokio::test]
    async fn sweep_never_expires_paid_rental() {
        let engine = test_engine("expire_paid.wal");
        let config = ReconcilerConfig::default();
        let device = Ulid::new();
        engine.register_device(device, 1).await.unwrap();

        let rental = Ulid::new();
        let t0 = 1_000_000 * M;
        engine
            .create_rental(rental, Ulid::new(), Ulid::new(), device, H, pricing(), t0)
            .await
            .unwrap();
        engine.mark_paid(rental).await.unwrap();

        run_sweeps(&engine, &config, t0 + 45 * M).await;
        let info = engine.get_rental_info(&rental).unwrap();
        assert_eq!(info.status, RentalStatus::Paid);
    }

    #[tokio::test]
    async fn sweep_flags_overdue_without_freeing_slot() {
        let engine = test_engine("flag_overdue.wal");
        let config = ReconcilerConfig::default();
        let device = Ulid::new();
        engine.register_device(device, 1).await.unwrap();

        let rental = Ulid::new();
        let t0 = 1_000_000 * M;
        engine
            .create_rental(rental, Ulid::new(), Ulid::new(), device, H, pricing(), t0)
            .await
            .unwrap();
        engine.mark_paid(rental).await.unwrap();
        engine.unlock(rental, t0).await.unwrap();

        run_sweeps(&engine, &config, t0 + H + M).await;
        let info = engine.get_rental_info(&rental).unwrap();
        assert_eq!(info.status, RentalStatus::Overdue);
        // Device still physically occupied
        let acct = engine.device_accounting(&device).unwrap();
        assert_eq!(acct.available_slots, 0);
        assert_eq!(acct.outstanding, 1);
    }

    #[tokio::test]
    async fn sweep_autocompletes_after_settle_delay() {
        let engine = test_engine("autocomplete.wal");
        let config = ReconcilerConfig::default();
        let device = Ulid::new();
        engine.register_device(device, 1).await.unwrap();

        let rental = Ulid::new();
        let t0 = 1_000_000 * M;
        engine
            .create_rental(rental, Ulid::new(), Ulid::new(), device, H, pricing(), t0)
            .await
            .unwrap();
        engine.mark_paid(rental).await.unwrap();
        engine.unlock(rental, t0).await.unwrap();
        engine.return_rental(rental, t0 + H).await.unwrap();

        // Within the dispute window: still Returned, slot still held
        run_sweeps(&engine, &config, t0 + H + 4 * M).await;
        assert_eq!(
            engine.get_rental_info(&rental).unwrap().status,
            RentalStatus::Returned
        );

        run_sweeps(&engine, &config, t0 + H + 6 * M).await;
        assert_eq!(
            engine.get_rental_info(&rental).unwrap().status,
            RentalStatus::Completed
        );
        let acct = engine.device_accounting(&device).unwrap();
        assert_eq!(acct.available_slots, 1);
    }

    #[tokio::test]
    async fn sweep_closes_expired_payments() {
        let engine = test_engine("close_payments.wal");
        let config = ReconcilerConfig::default();
        let t0 = 1_000_000 * M;

        let fresh = Ulid::new();
        let stale = Ulid::new();
        engine
            .record_payment(fresh, Ulid::new(), 500, t0, t0 + 30 * M)
            .await
            .unwrap();
        engine
            .record_payment(stale, Ulid::new(), 500, t0 - H, t0 - 30 * M)
            .await
            .unwrap();

        run_sweeps(&engine, &config, t0).await;
        assert_eq!(
            engine.get_payment_info(&stale).unwrap().status,
            PaymentStatus::Expired
        );
        assert_eq!(
            engine.get_payment_info(&fresh).unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn sweep_is_idempotent_across_ticks() {
        let engine = test_engine("idempotent_ticks.wal");
        let config = ReconcilerConfig::default();
        let device = Ulid::new();
        engine.register_device(device, 2).await.unwrap();

        let rental = Ulid::new();
        let t0 = 1_000_000 * M;
        engine
            .create_rental(rental, Ulid::new(), Ulid::new(), device, H, pricing(), t0)
            .await
            .unwrap();

        // Three ticks past the grace window: exactly one cancellation
        for i in 0..3i64 {
            run_sweeps(&engine, &config, t0 + (31 + i) * M).await;
        }
        assert_eq!(
            engine.get_rental_info(&rental).unwrap().status,
            RentalStatus::Cancelled
        );
        let acct = engine.device_accounting(&device).unwrap();
        assert_eq!(acct.available_slots, 2);

        let cancelled = engine.list_rentals(&RentalFilter {
            status: Some(RentalStatus::Cancelled),
            ..Default::default()
        });
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn sweep_honors_batch_size() {
        let engine = test_engine("batch_size.wal");
        let config = ReconcilerConfig {
            batch_size: 3,
            ..Default::default()
        };
        let device = Ulid::new();
        engine.register_device(device, 10).await.unwrap();

        let t0 = 1_000_000 * M;
        for _ in 0..5 {
            engine
                .create_rental(Ulid::new(), Ulid::new(), Ulid::new(), device, H, pricing(), t0)
                .await
                .unwrap();
        }

        run_sweeps(&engine, &config, t0 + 31 * M).await;
        let pending = engine.list_rentals(&RentalFilter {
            status: Some(RentalStatus::Pending),
            ..Default::default()
        });
        assert_eq!(pending.len(), 2, "one tick cancels at most batch_size");

        run_sweeps(&engine, &config, t0 + 32 * M).await;
        let pending = engine.list_rentals(&RentalFilter {
            status: Some(RentalStatus::Pending),
            ..Default::default()
        });
        assert!(pending.is_empty(), "next tick drains the rest");
    }
}
