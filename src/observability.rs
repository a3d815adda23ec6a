use std::net::SocketAddr;

// ── Slot locks ──────────────────────────────────────────────────

/// Counter: locks granted (including TTL refreshes).
pub const LOCKS_GRANTED_TOTAL: &str = "courtbook_locks_granted_total";

/// Counter: lock requests refused because another owner holds the slot.
pub const LOCKS_DENIED_TOTAL: &str = "courtbook_locks_denied_total";

/// Counter: locks removed by TTL, by sweep or takeover.
pub const LOCKS_EXPIRED_TOTAL: &str = "courtbook_locks_expired_total";

/// Gauge: entries in the lock table.
pub const LOCKS_ACTIVE: &str = "courtbook_locks_active";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: matches placed by the auto-scheduler.
pub const MATCHES_SCHEDULED_TOTAL: &str = "courtbook_matches_scheduled_total";

/// Counter: matches the auto-scheduler could not place.
pub const MATCHES_UNPLACED_TOTAL: &str = "courtbook_matches_unplaced_total";

/// Histogram: wall time of one auto-schedule run in seconds.
pub const SCHEDULE_RUN_SECONDS: &str = "courtbook_schedule_run_seconds";

/// Counter: per-match confirmation outcomes. Labels: status.
pub const CONFIRMATIONS_TOTAL: &str = "courtbook_confirmations_total";

/// Counter: rejected manual schedule edits.
pub const BATCH_CONFLICTS_TOTAL: &str = "courtbook_batch_conflicts_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: events per journal flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
