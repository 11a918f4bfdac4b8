use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ──────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rentd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rentd_query_duration_seconds";

// ── Connections ──────────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "rentd_auth_failures_total";

// ── Journal ──────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

// ── Reservations ─────────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "rentd_reservations_created_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "rentd_reservation_transitions_total";

/// Counter: booking attempts refused by the conflict checker. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "rentd_booking_rejections_total";

// ── Handover codes ───────────────────────────────────────────────

/// Counter: codes issued. Labels: phase.
pub const OTP_ISSUED_TOTAL: &str = "rentd_otp_issued_total";

/// Counter: verification attempts. Labels: outcome.
pub const OTP_VERIFICATIONS_TOTAL: &str = "rentd_otp_verifications_total";

/// Gauge: challenges currently held.
pub const OTP_LIVE_CHALLENGES: &str = "rentd_otp_live_challenges";

/// Counter: challenges dropped without being redeemed. Labels: cause.
pub const OTP_EVICTIONS_TOTAL: &str = "rentd_otp_evictions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterVehicle { .. } => "register_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::AddWindow { .. } => "add_window",
        Command::UpdateWindow { .. } => "update_window",
        Command::RemoveWindow { .. } => "remove_window",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectCanBook { .. } => "select_can_book",
        Command::CreateReservation { .. } => "create_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::DisputeReservation { .. } => "dispute_reservation",
        Command::IssueCode { .. } => "issue_code",
        Command::Pickup { .. } => "pickup",
        Command::Return { .. } => "return",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectActiveReservation => "select_active_reservation",
        Command::SelectReservationHistory => "select_reservation_history",
    }
}
