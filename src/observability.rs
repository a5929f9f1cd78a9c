use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomcal_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomcal_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_CREATED_TOTAL: &str = "roomcal_bookings_created_total";

/// Counter: bookings deleted.
pub const BOOKINGS_DELETED_TOTAL: &str = "roomcal_bookings_deleted_total";

/// Counter: booking requests refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "roomcal_bookings_rejected_total";

/// Counter: notifications the notifier failed to accept.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "roomcal_notifications_failed_total";

/// Counter: stored bookings skipped because their start does not parse.
pub const MALFORMED_BOOKINGS_TOTAL: &str = "roomcal_malformed_bookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomcal_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomcal_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomcal_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomcal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomcal_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomcal_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { upsert: false, .. } => "insert_room",
        Command::InsertRoom { upsert: true, .. } => "upsert_room",
        Command::InsertClass { .. } => "insert_class",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectRooms => "select_rooms",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectSlotOptions { .. } => "select_slot_options",
        Command::SelectMonthCalendar { .. } => "select_month_calendar",
        Command::SelectDayTimeline { .. } => "select_day_timeline",
        Command::SelectNotifications { .. } => "select_notifications",
    }
}
