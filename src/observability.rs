use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

// ── Booking workflow ────────────────────────────────────────────

/// Counter: bookings accepted as pending.
pub const BOOKINGS_CREATED_TOTAL: &str = "roomd_bookings_created_total";

/// Counter: status transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "roomd_transitions_total";

/// Counter: requests refused because the room was already taken.
pub const CONFLICTS_TOTAL: &str = "roomd_conflicts_total";

/// Counter: notifications that could not be delivered.
pub const NOTIFY_FAILURES_TOTAL: &str = "roomd_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Counter: login failures.
pub const AUTH_FAILURES_TOTAL: &str = "roomd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom(_) => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::SelectRooms => "select_rooms",
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SetStatus { .. } => "set_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectMyBookings(_) => "select_my_bookings",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectStatistics { .. } => "select_statistics",
        Command::SelectUpcoming { .. } => "select_upcoming",
    }
}
