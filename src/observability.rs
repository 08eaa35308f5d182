use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotd_request_duration_seconds";

/// Counter: hold grants.
pub const HOLDS_GRANTED_TOTAL: &str = "slotd_holds_granted_total";

/// Counter: hold denials (slot taken/blocked/lost race).
pub const HOLDS_DENIED_TOTAL: &str = "slotd_holds_denied_total";

/// Counter: hold requests rejected by the rate limiter.
pub const HOLD_LIMIT_HITS_TOTAL: &str = "slotd_hold_limit_hits_total";

/// Counter: confirmed bookings.
pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";

/// Counter: booking attempts re-run after a write conflict.
pub const BOOKING_RETRIES_TOTAL: &str = "slotd_booking_retries_total";

/// Counter: bookings abandoned after the retry budget.
pub const BOOKING_FAILURES_TOTAL: &str = "slotd_booking_failures_total";

/// Counter: cancellations (either path).
pub const CANCELLATIONS_TOTAL: &str = "slotd_cancellations_total";

/// Counter: explicit provider completions.
pub const COMPLETIONS_TOTAL: &str = "slotd_completions_total";

/// Counter: optimistic commit validations that failed.
pub const WRITE_CONFLICTS_TOTAL: &str = "slotd_write_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Counter: sweeper cycles run.
pub const SWEEPS_TOTAL: &str = "slotd_sweeps_total";

/// Counter: expired holds reclaimed by the sweeper.
pub const HOLDS_RECLAIMED_TOTAL: &str = "slotd_holds_reclaimed_total";

/// Counter: appointments promoted to Completed by the sweeper.
pub const SWEEP_COMPLETIONS_TOTAL: &str = "slotd_sweep_completions_total";

/// Counter: read-cache hits.
pub const CACHE_HITS_TOTAL: &str = "slotd_cache_hits_total";

/// Counter: read-cache misses.
pub const CACHE_MISSES_TOTAL: &str = "slotd_cache_misses_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

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
