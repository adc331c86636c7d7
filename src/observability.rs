use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "classbook_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "classbook_request_duration_seconds";

/// Counter: booking commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "classbook_commands_total";

/// Histogram: booking command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "classbook_command_duration_seconds";

/// Counter: commands answered from the idempotency cache.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "classbook_idempotent_replays_total";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: enroll attempts. Labels: outcome (reserved, waitlisted, full, restricted).
pub const ENROLLMENTS_TOTAL: &str = "classbook_enrollments_total";

/// Counter: reservation cancellations. Labels: late.
pub const CANCELLATIONS_TOTAL: &str = "classbook_cancellations_total";

/// Counter: waitlist promotions.
pub const PROMOTIONS_TOTAL: &str = "classbook_promotions_total";

/// Counter: check-ins and attendance marks. Labels: status.
pub const ATTENDANCE_TOTAL: &str = "classbook_attendance_total";

/// Counter: strikes recorded. Labels: kind.
pub const STRIKES_TOTAL: &str = "classbook_strikes_total";

/// Counter: restrictions started.
pub const RESTRICTIONS_TOTAL: &str = "classbook_restrictions_total";

/// Counter: lock acquisitions that found their class removed and retried.
pub const STALE_RETRIES_TOTAL: &str = "classbook_stale_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "classbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "classbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "classbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "classbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "classbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged; the service keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
