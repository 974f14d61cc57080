use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::{Command, SqlError};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tablebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tablebook_query_duration_seconds";

/// Counter: reservation writes refused by validation. Labels: kind.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "tablebook_reservations_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tablebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tablebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tablebook_connections_rejected_total";

/// Gauge: venues with a loaded engine.
pub const VENUES_ACTIVE: &str = "tablebook_venues_active";

/// Counter: logins refused before the password check.
pub const AUTH_FAILURES_TOTAL: &str = "tablebook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablebook_wal_flush_batch_size";

/// Install the Prometheus exporter on `addr`. No-op if `addr` is None.
pub fn init(addr: Option<SocketAddr>) -> Result<(), BuildError> {
    let Some(addr) = addr else { return Ok(()) };
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTables { .. } => "insert_tables",
        Command::SelectTables { .. } => "select_tables",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectStats { .. } => "select_stats",
    }
}

/// Label for a parse outcome; rejected SQL is counted as `invalid`.
pub fn statement_label(parsed: &Result<Command, SqlError>) -> &'static str {
    parsed.as_ref().map_or("invalid", command_label)
}
