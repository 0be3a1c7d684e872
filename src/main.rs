use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rentd::engine::{Engine, EngineConfig, SlotReleasePolicy};
use rentd::gateway::AcceptAllGateway;
use rentd::notify::NotifyHub;
use rentd::registry::StaticRegistry;
use rentd::scheduler::{self, ReconcilerConfig};

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("RENTD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    rentd::observability::init(metrics_port);

    let data_dir = std::env::var("RENTD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("RENTD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let settlement_interval =
        env_secs("RENTD_SETTLEMENT_INTERVAL_SECS").unwrap_or(Duration::from_secs(3600));

    let mut reconciler = ReconcilerConfig::default();
    if let Some(v) = env_secs("RENTD_SWEEP_INTERVAL_SECS") {
        reconciler.sweep_interval = v;
    }
    if let Some(v) = env_secs("RENTD_PENDING_PAYMENT_GRACE_SECS") {
        reconciler.pending_payment_grace = v;
    }
    if let Some(v) = env_secs("RENTD_RETURN_SETTLE_DELAY_SECS") {
        reconciler.return_settle_delay = v;
    }
    if let Ok(s) = std::env::var("RENTD_BATCH_SIZE")
        && let Ok(v) = s.parse()
    {
        reconciler.batch_size = v;
    }

    let mut engine_config = EngineConfig::default();
    if std::env::var("RENTD_SLOT_RELEASE").as_deref() == Ok("on_return") {
        engine_config.slot_release = SlotReleasePolicy::OnReturn;
    }

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("rentd.wal");

    let notify = Arc::new(NotifyHub::new());
    let registry = Arc::new(StaticRegistry::new());
    let gateway = Arc::new(AcceptAllGateway);
    let engine = Arc::new(Engine::new(
        wal_path,
        notify,
        registry,
        gateway,
        engine_config,
    )?);

    info!("rentd started");
    info!("  data_dir: {data_dir}");
    info!("  sweep_interval: {:?}", reconciler.sweep_interval);
    info!("  pending_payment_grace: {:?}", reconciler.pending_payment_grace);
    info!("  return_settle_delay: {:?}", reconciler.return_settle_delay);
    info!("  batch_size: {}", reconciler.batch_size);
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    tokio::spawn(scheduler::run_reconciler(engine.clone(), reconciler));
    tokio::spawn(scheduler::run_settlement_loop(
        engine.clone(),
        settlement_interval,
    ));
    tokio::spawn(scheduler::run_compactor(engine.clone(), compact_threshold));

    // Run until SIGTERM/ctrl-c; in-flight engine calls finish on their own.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("rentd stopped");
    Ok(())
}
