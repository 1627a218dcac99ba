use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Validate a candidate occupation interval and turn it into a `Span`.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Validate a read window (calendar, free slots).
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::validation(format!(
            "window start ({start}) must be before window end ({end})"
        )));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Required free-text field: non-blank, bounded.
pub(crate) fn require_text(field: &'static str, value: &str, max_len: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    limit_text(field, value, max_len)
}

pub(crate) fn limit_text(field: &'static str, value: &str, max_len: usize) -> Result<(), EngineError> {
    if value.len() > max_len {
        return Err(EngineError::validation(format!(
            "{field} longer than {max_len} bytes"
        )));
    }
    Ok(())
}

/// First active occupation that overlaps `span`. `exclude_booking` skips one
/// booking; blocks are never skipped.
pub fn find_conflict<'a>(
    rs: &'a ResourceState,
    span: &Span,
    exclude_booking: Option<Ulid>,
) -> Option<&'a Interval> {
    rs.overlapping(span)
        .find(|i| !(i.kind == IntervalKind::Booking && Some(i.id) == exclude_booking))
}

pub fn is_free(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_none()
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(interval) => Err(EngineError::Conflict {
            resource_id: rs.id,
            with: interval.id,
            kind: interval.kind,
            span: interval.span,
        }),
        None => Ok(()),
    }
}
