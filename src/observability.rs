use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reserve attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "printbay_reservations_total";

/// Histogram: reserve latency in seconds, including actuation.
pub const RESERVE_DURATION_SECONDS: &str = "printbay_reserve_duration_seconds";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "printbay_cancellations_total";

/// Counter: completions started. Labels: trigger (timer, cancel).
pub const COMPLETIONS_TOTAL: &str = "printbay_completions_total";

// ── Failure paths ───────────────────────────────────────────────

/// Counter: relay switch failures. Labels: op (on, off).
pub const ACTUATION_FAILURES_TOTAL: &str = "printbay_actuation_failures_total";

/// Counter: compensating transactions after a failed power-on. Labels: outcome.
pub const ROLLBACKS_TOTAL: &str = "printbay_rollbacks_total";

/// Counter: resources put into quarantine.
pub const QUARANTINED_TOTAL: &str = "printbay_quarantined_total";

/// Counter: rows handled by the startup sweep. Labels: action.
pub const RECOVERY_ROWS_TOTAL: &str = "printbay_recovery_rows_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: timers currently armed.
pub const SCHEDULED_EXPIRIES: &str = "printbay_scheduled_expiries";

/// Histogram: time to append and fsync one commit, in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "printbay_wal_flush_duration_seconds";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
