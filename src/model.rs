use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// `max(a_start, b_start) < min(a_end, b_end)`. Touching intervals do not overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start.max(b_start) < a_end.min(b_end)
}

/// `hours(span) * rate`, rounded half-up to the cent.
pub fn total_price_cents(span: &Span, hourly_rate_cents: u64) -> u64 {
    let duration = span.duration_ms().max(0) as u128;
    let hour = HOUR_MS as u128;
    let cents = (duration * hourly_rate_cents as u128 + hour / 2) / hour;
    u64::try_from(cents).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Available,
    Maintenance,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Available => "AVAILABLE",
            ResourceStatus::Maintenance => "MAINTENANCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// What occupies a slice of a resource's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    /// A CONFIRMED booking.
    Booking,
    /// An administrative block.
    Block,
}

impl IntervalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalKind::Booking => "booking",
            IntervalKind::Block => "block",
        }
    }
}

/// One active occupation in a resource's interval index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub resource_type: String,
    /// Headcount the resource seats. Descriptive only: a resource never
    /// holds more than one occupation at a time.
    pub capacity: u32,
    pub hourly_rate_cents: u64,
    pub status: ResourceStatus,
}

/// Descriptive fields of a resource, as supplied by an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDraft {
    pub name: String,
    pub resource_type: String,
    pub capacity: u32,
    pub hourly_rate_cents: u64,
    pub status: ResourceStatus,
}

/// Partial update of a resource. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub resource_type: Option<String>,
    pub capacity: Option<u32>,
    pub hourly_rate_cents: Option<u64>,
    pub status: Option<ResourceStatus>,
}

impl From<ResourceDraft> for ResourcePatch {
    fn from(d: ResourceDraft) -> Self {
        ResourcePatch {
            name: Some(d.name),
            resource_type: Some(d.resource_type),
            capacity: Some(d.capacity),
            hourly_rate_cents: Some(d.hourly_rate_cents),
            status: Some(d.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub total_price_cents: u64,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<String>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBlock {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub reason: String,
    pub created_by: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub resource_type: String,
    pub capacity: u32,
    pub hourly_rate_cents: u64,
    pub status: ResourceStatus,
    /// Active occupations (CONFIRMED bookings + blocks), sorted by `span.start`.
    pub intervals: Vec<Interval>,
    /// Longest span ever inserted. Bounds how far left an overlap query must look.
    pub max_span_ms: Ms,
    /// Every booking ever made on this resource, cancelled ones included.
    pub bookings: HashMap<Ulid, Booking>,
    pub blocks: HashMap<Ulid, ResourceBlock>,
}

impl ResourceState {
    pub fn new(id: Ulid, draft: ResourceDraft) -> Self {
        Self {
            id,
            name: draft.name,
            resource_type: draft.resource_type,
            capacity: draft.capacity,
            hourly_rate_cents: draft.hourly_rate_cents,
            status: draft.status,
            intervals: Vec::new(),
            max_span_ms: 0,
            bookings: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            resource_type: self.resource_type.clone(),
            capacity: self.capacity,
            hourly_rate_cents: self.hourly_rate_cents,
            status: self.status,
        }
    }

    /// The current fields with `patch` laid over them.
    pub fn patched(&self, patch: ResourcePatch) -> ResourceDraft {
        ResourceDraft {
            name: patch.name.unwrap_or_else(|| self.name.clone()),
            resource_type: patch.resource_type.unwrap_or_else(|| self.resource_type.clone()),
            capacity: patch.capacity.unwrap_or(self.capacity),
            hourly_rate_cents: patch.hourly_rate_cents.unwrap_or(self.hourly_rate_cents),
            status: patch.status.unwrap_or(self.status),
        }
    }

    pub fn apply_draft(&mut self, draft: ResourceDraft) {
        self.name = draft.name;
        self.resource_type = draft.resource_type;
        self.capacity = draft.capacity;
        self.hourly_rate_cents = draft.hourly_rate_cents;
        self.status = draft.status;
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        self.max_span_ms = self.max_span_ms.max(interval.span.duration_ms());
        let pos = self
            .intervals
            .partition_point(|i| i.span.start <= interval.span.start);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    ///
    /// Binary search on both sides: everything starting at or after `query.end`
    /// can't overlap, and neither can anything starting at or before
    /// `query.start - max_span_ms`, because no interval is longer than that.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        let floor = query.start.saturating_sub(self.max_span_ms);
        let left_bound = self.intervals[..right_bound].partition_point(|i| i.span.start <= floor);
        let query_start = query.start;
        self.intervals[left_bound..right_bound]
            .iter()
            .filter(move |i| i.span.end > query_start)
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        resource_type: String,
        capacity: u32,
        hourly_rate_cents: u64,
        status: ResourceStatus,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        resource_type: String,
        capacity: u32,
        hourly_rate_cents: u64,
        status: ResourceStatus,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        resource_id: Ulid,
        user_id: String,
        span: Span,
        total_price_cents: u64,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
        cancelled_by: String,
        cancelled_at: Ms,
    },
    BlockCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: String,
        created_by: String,
        created_at: Ms,
    },
    BlockDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn resource_created(id: Ulid, draft: &ResourceDraft) -> Self {
        Event::ResourceCreated {
            id,
            name: draft.name.clone(),
            resource_type: draft.resource_type.clone(),
            capacity: draft.capacity,
            hourly_rate_cents: draft.hourly_rate_cents,
            status: draft.status,
        }
    }

    pub fn resource_updated(id: Ulid, draft: &ResourceDraft) -> Self {
        Event::ResourceUpdated {
            id,
            name: draft.name.clone(),
            resource_type: draft.resource_type.clone(),
            capacity: draft.capacity,
            hourly_rate_cents: draft.hourly_rate_cents,
            status: draft.status,
        }
    }
}

// ── Derived views ────────────────────────────────────────────────

/// A calendar entry. Built only by the calendar query, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarEvent {
    Booking {
        id: Ulid,
        resource_id: Ulid,
        resource_name: String,
        user_id: String,
        span: Span,
        total_price_cents: u64,
    },
    Block {
        id: Ulid,
        resource_id: Ulid,
        resource_name: String,
        span: Span,
        reason: String,
    },
}

impl CalendarEvent {
    pub fn id(&self) -> Ulid {
        match self {
            CalendarEvent::Booking { id, .. } | CalendarEvent::Block { id, .. } => *id,
        }
    }

    pub fn resource_id(&self) -> Ulid {
        match self {
            CalendarEvent::Booking { resource_id, .. } | CalendarEvent::Block { resource_id, .. } => {
                *resource_id
            }
        }
    }

    pub fn span(&self) -> Span {
        match self {
            CalendarEvent::Booking { span, .. } | CalendarEvent::Block { span, .. } => *span,
        }
    }

    pub fn kind(&self) -> IntervalKind {
        match self {
            CalendarEvent::Booking { .. } => IntervalKind::Booking,
            CalendarEvent::Block { .. } => IntervalKind::Block,
        }
    }

    /// Display title: "<resource> - Booked" or the block reason.
    pub fn title(&self) -> String {
        match self {
            CalendarEvent::Booking { resource_name, .. } => format!("{resource_name} - Booked"),
            CalendarEvent::Block { reason, .. } if reason.is_empty() => "Blocked".to_string(),
            CalendarEvent::Block { reason, .. } => reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Resource,
    Booking,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Cancelled,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Snapshot {
    Resource(ResourceInfo),
    Booking(Booking),
    Block(ResourceBlock),
}

/// Description of a committed mutation, handed to audit and notification sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub resource_id: Ulid,
    pub entity: EntityKind,
    pub entity_id: Ulid,
    pub action: ChangeAction,
    pub actor: Option<String>,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
    pub at: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub resource_id: Option<Ulid>,
    pub user_id: Option<String>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub resource_type: Option<String>,
    pub status: Option<ResourceStatus>,
    /// Case-insensitive substring of the name or type.
    pub search: Option<String>,
    pub offset: usize,
    /// Page size; `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

/// One page of `list_resources`. `total` counts every match, not just this page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePage {
    pub resources: Vec<ResourceInfo>,
    pub total: usize,
}

/// Confirmed booking revenue for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRevenue {
    pub resource_type: String,
    pub bookings: u64,
    pub revenue_cents: u64,
}

/// Bookings starting in one UTC calendar month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyBookings {
    pub year: i32,
    /// 1-based.
    pub month: u32,
    pub confirmed: u64,
    pub cancelled: u64,
    pub revenue_cents: u64,
}
