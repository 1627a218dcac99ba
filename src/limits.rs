use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TYPE_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_ACTOR_LEN: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single booking or block may not span more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Calendar / free-slot windows.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;

/// Largest page `list_resources` returns.
pub const MAX_PAGE_LIMIT: usize = 1_000;
/// Widest `bookings_by_month` report.
pub const MAX_REPORT_MONTHS: u32 = 120;

/// Concurrent `watch` subscriptions on one connection.
pub const MAX_WATCHES_PER_CONNECTION: usize = 64;

/// Longest accepted protocol line, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
