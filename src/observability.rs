use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: rentals created. Labels: none.
pub const RENTALS_CREATED_TOTAL: &str = "rentd_rentals_created_total";

/// Counter: reservations rejected for lack of capacity.
pub const SLOT_UNAVAILABLE_TOTAL: &str = "rentd_slot_unavailable_total";

/// Counter: rental state transitions applied. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "rentd_transitions_total";

/// Counter: refund requests rejected by the occupied-credit cap.
pub const REFUND_OVER_CAP_TOTAL: &str = "rentd_refund_over_cap_total";

// ── Scheduler metrics ───────────────────────────────────────────

/// Counter: reconciliation sweep passes. Labels: sweep.
pub const SWEEPS_TOTAL: &str = "rentd_sweeps_total";

/// Counter: individual records a sweep failed on (retried next tick).
pub const SWEEP_FAILURES_TOTAL: &str = "rentd_sweep_failures_total";

/// Counter: settlements created by the batching loop.
pub const SETTLEMENTS_CREATED_TOTAL: &str = "rentd_settlements_created_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
