use std::sync::Arc;

use tracing::{error, info, warn};

use printbay::actuation::DryRunActuator;
use printbay::config::Config;
use printbay::engine::Engine;
use printbay::quota::QuotaPolicy;
use printbay::store::{self, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("printbay=info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("configuration error: {e}");
        e
    })?;
    printbay::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.wal_path();
    let store = Arc::new(Store::open(&wal_path)?);

    let actuator = Arc::new(DryRunActuator::new());
    let quota = QuotaPolicy::new(store.clone(), config.default_max_active);
    let engine = Engine::new(store.clone(), actuator, quota);

    let report = engine.start().await?;
    for e in &report.inconsistencies {
        warn!("needs manual reconciliation: {e}");
    }

    let compactor = tokio::spawn(store::run_compactor(store.clone(), config.compact_threshold));

    info!("printbay running");
    info!("  wal: {}", wal_path.display());
    info!("  default max active: {}", config.default_max_active);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    engine.close().await;
    compactor.abort();
    if let Err(e) = store.compact().await {
        warn!("final WAL compaction failed: {e}");
    }

    info!("printbay stopped");
    Ok(())
}
