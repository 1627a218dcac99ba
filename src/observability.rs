use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests executed. Labels: op, status.
pub const QUERIES_TOTAL: &str = "reservd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const QUERY_DURATION_SECONDS: &str = "reservd_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

// ── Contention ──────────────────────────────────────────────────

/// Histogram: time spent waiting for a resource's exclusive section.
pub const LOCK_WAIT_SECONDS: &str = "reservd_lock_wait_seconds";

/// Counter: mutations that gave up on the section after the retry.
pub const LOCK_TIMEOUTS_TOTAL: &str = "reservd_lock_timeouts_total";

/// Counter: bookings and blocks refused because the interval was occupied.
pub const BOOKING_CONFLICTS_TOTAL: &str = "reservd_booking_conflicts_total";

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

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateResource { .. } => "create_resource",
        Request::UpdateResource { .. } => "update_resource",
        Request::DeleteResource { .. } => "delete_resource",
        Request::GetResource { .. } => "get_resource",
        Request::ListResources { .. } => "list_resources",
        Request::ResourceTypes => "resource_types",
        Request::CreateBooking { .. } => "create_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::CreateBlock { .. } => "create_block",
        Request::DeleteBlock { .. } => "delete_block",
        Request::ListBlocks { .. } => "list_blocks",
        Request::GetCalendar { .. } => "get_calendar",
        Request::IsFree { .. } => "is_free",
        Request::FreeSlots { .. } => "free_slots",
        Request::AvailableResources { .. } => "available_resources",
        Request::RevenueByType => "revenue_by_type",
        Request::BookingsByMonth { .. } => "bookings_by_month",
        Request::Watch { .. } => "watch",
    }
}
