use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (`reserved` | `conflict`).
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Orphaned claims ─────────────────────────────────────────────

/// Counter: unfinalized claims released by the reaper after expiry.
pub const ORPHANED_CLAIMS_RELEASED_TOTAL: &str = "slotbook_orphaned_claims_released_total";

/// Counter: domain-record hand-offs that failed after a successful claim.
pub const FOLLOW_UP_FAILURES_TOTAL: &str = "slotbook_follow_up_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectUnavailableDates { .. } => "select_unavailable_dates",
        Command::SelectWorkingHours { .. } => "select_working_hours",
        Command::SelectSlotCounts { .. } => "select_slot_counts",
        Command::SelectSlotStatus { .. } => "select_slot_status",
        Command::SelectNearestSlot { .. } => "select_nearest_slot",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectServices => "select_services",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertConfirmation { .. } => "insert_confirmation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertClaimRenewal { .. } => "insert_claim_renewal",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertWorkingHours { .. } => "insert_working_hours",
        Command::DeleteWorkingHours { .. } => "delete_working_hours",
        Command::InsertUnits { .. } => "insert_units",
        Command::InsertBlockedDate { .. } => "insert_blocked_date",
        Command::DeleteBlockedDate { .. } => "delete_blocked_date",
    }
}
