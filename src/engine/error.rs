use ulid::Ulid;

use crate::model::{IntervalKind, Ms, Span};

/// Stable error taxonomy exposed to calling layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Maintenance,
    Conflict,
    Retryable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Maintenance => "maintenance",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Retryable => "retryable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Malformed interval or missing field.
    Validation(String),
    LimitExceeded(&'static str),
    /// The configured cancellation policy forbids cancelling a booking that has started.
    CancellationClosed {
        booking_id: Ulid,
        start: Ms,
    },
    NotFound(Ulid),
    Maintenance(Ulid),
    Conflict {
        resource_id: Ulid,
        with: Ulid,
        kind: IntervalKind,
        span: Span,
    },
    /// Resource still has bookings and cannot be deleted.
    InUse(Ulid),
    /// Exclusive section could not be acquired in time.
    Retryable(Ulid),
    WalError(String),
    /// Failure outside the log, such as encoding a reply.
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::LimitExceeded(_)
            | EngineError::CancellationClosed { .. } => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Maintenance(_) => ErrorKind::Maintenance,
            EngineError::Conflict { .. } | EngineError::InUse(_) => ErrorKind::Conflict,
            EngineError::Retryable(_) => ErrorKind::Retryable,
            EngineError::WalError(_) | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Conflict-class errors: the request was well-formed but the slot is not
    /// available right now.
    pub fn is_conflict_class(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Retryable)
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::CancellationClosed { booking_id, start } => write!(
                f,
                "booking {booking_id} started at {start} and can no longer be cancelled"
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Maintenance(id) => {
                write!(f, "resource {id} is under maintenance and cannot be booked")
            }
            EngineError::Conflict {
                resource_id,
                with,
                kind,
                span,
            } => write!(
                f,
                "resource {resource_id} is occupied by {} {with} during [{}, {})",
                kind.as_str(),
                span.start,
                span.end
            ),
            EngineError::InUse(id) => write!(f, "cannot delete resource {id}: it has bookings"),
            EngineError::Retryable(id) => {
                write!(f, "resource {id} is busy, retry the operation")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
