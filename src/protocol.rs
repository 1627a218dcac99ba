//! Newline-delimited JSON request/response protocol.
//!
//! Every request is one JSON object with an `op` field; every reply is one
//! JSON object, either `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":...,"message":...}}`.

use chrono::{DateTime, NaiveDate, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;

const DEFAULT_REPORT_MONTHS: u32 = 12;

fn default_capacity() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateResource {
        #[serde(flatten)]
        fields: ResourceFields,
    },
    UpdateResource {
        id: Ulid,
        #[serde(flatten)]
        fields: ResourcePatchFields,
    },
    DeleteResource {
        id: Ulid,
    },
    GetResource {
        id: Ulid,
    },
    ListResources {
        #[serde(rename = "type")]
        resource_type: Option<String>,
        status: Option<ResourceStatus>,
        search: Option<String>,
        offset: Option<usize>,
        limit: Option<usize>,
    },
    ResourceTypes,
    CreateBooking {
        resource_id: Ulid,
        user_id: String,
        start: String,
        end: String,
    },
    CancelBooking {
        booking_id: Ulid,
        actor_id: String,
    },
    GetBooking {
        id: Ulid,
    },
    ListBookings {
        resource_id: Option<Ulid>,
        user_id: Option<String>,
        status: Option<BookingStatus>,
    },
    CreateBlock {
        resource_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        reason: String,
        created_by: String,
    },
    DeleteBlock {
        block_id: Ulid,
    },
    ListBlocks {
        resource_id: Option<Ulid>,
    },
    GetCalendar {
        resource_id: Option<Ulid>,
        start: String,
        end: String,
    },
    IsFree {
        resource_id: Ulid,
        start: String,
        end: String,
        exclude_booking_id: Option<Ulid>,
    },
    FreeSlots {
        resource_id: Ulid,
        start: String,
        end: String,
        min_duration_minutes: Option<i64>,
    },
    AvailableResources {
        start: String,
        end: String,
        #[serde(rename = "type")]
        resource_type: Option<String>,
    },
    RevenueByType,
    BookingsByMonth {
        months: Option<u32>,
        /// Last month of the report; defaults to now.
        until: Option<String>,
    },
    /// Stream change records for one resource, or all of them, on this
    /// connection. Handled by the connection loop, not `execute`.
    Watch {
        resource_id: Option<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceFields {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    pub hourly_rate_cents: u64,
    #[serde(default)]
    pub status: Option<ResourceStatus>,
}

/// Fields of an update. Omitted fields keep their current values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourcePatchFields {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub capacity: Option<u32>,
    pub hourly_rate_cents: Option<u64>,
    pub status: Option<ResourceStatus>,
}

impl From<ResourcePatchFields> for ResourcePatch {
    fn from(f: ResourcePatchFields) -> Self {
        ResourcePatch {
            name: f.name,
            resource_type: f.resource_type,
            capacity: f.capacity,
            hourly_rate_cents: f.hourly_rate_cents,
            status: f.status,
        }
    }
}

impl From<ResourceFields> for ResourceDraft {
    fn from(f: ResourceFields) -> Self {
        ResourceDraft {
            name: f.name,
            resource_type: f.resource_type,
            capacity: f.capacity,
            hourly_rate_cents: f.hourly_rate_cents,
            status: f.status.unwrap_or(ResourceStatus::Available),
        }
    }
}

pub fn parse_request(line: &str) -> Result<Request, EngineError> {
    serde_json::from_str(line).map_err(|e| EngineError::validation(format!("bad request: {e}")))
}

// ── Time ─────────────────────────────────────────────────────────

/// RFC 3339 timestamp → Unix ms.
pub fn parse_timestamp(field: &str, value: &str) -> Result<Ms, EngineError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| EngineError::validation(format!("{field}: invalid timestamp {value:?}: {e}")))
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` date meaning UTC midnight.
pub fn parse_window_bound(field: &str, value: &str) -> Result<Ms, EngineError> {
    if let Ok(date) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }
    parse_timestamp(field, value)
}

pub fn format_timestamp(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn interval_bounds(start: &str, end: &str) -> Result<(Ms, Ms), EngineError> {
    Ok((parse_timestamp("start", start)?, parse_timestamp("end", end)?))
}

fn window_bounds(start: &str, end: &str) -> Result<(Ms, Ms), EngineError> {
    Ok((parse_window_bound("start", start)?, parse_window_bound("end", end)?))
}

// ── Reply payloads ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SpanDto {
    pub start: String,
    pub end: String,
}

impl From<Span> for SpanDto {
    fn from(span: Span) -> Self {
        SpanDto {
            start: format_timestamp(span.start),
            end: format_timestamp(span.end),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResourceDto {
    pub id: Ulid,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub capacity: u32,
    pub hourly_rate_cents: u64,
    pub status: ResourceStatus,
}

impl From<ResourceInfo> for ResourceDto {
    fn from(r: ResourceInfo) -> Self {
        ResourceDto {
            id: r.id,
            name: r.name,
            resource_type: r.resource_type,
            capacity: r.capacity,
            hourly_rate_cents: r.hourly_rate_cents,
            status: r.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingDto {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: String,
    pub start: String,
    pub end: String,
    pub status: BookingStatus,
    pub total_price_cents: u64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

impl From<Booking> for BookingDto {
    fn from(b: Booking) -> Self {
        BookingDto {
            id: b.id,
            resource_id: b.resource_id,
            user_id: b.user_id,
            start: format_timestamp(b.span.start),
            end: format_timestamp(b.span.end),
            status: b.status,
            total_price_cents: b.total_price_cents,
            created_at: format_timestamp(b.created_at),
            cancelled_at: b.cancelled_at.map(format_timestamp),
            cancelled_by: b.cancelled_by,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BlockDto {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: String,
    pub end: String,
    pub reason: String,
    pub created_by: String,
    pub created_at: String,
}

impl From<ResourceBlock> for BlockDto {
    fn from(b: ResourceBlock) -> Self {
        BlockDto {
            id: b.id,
            resource_id: b.resource_id,
            start: format_timestamp(b.span.start),
            end: format_timestamp(b.span.end),
            reason: b.reason,
            created_by: b.created_by,
            created_at: format_timestamp(b.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CalendarEventDto {
    pub kind: IntervalKind,
    pub id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub title: String,
    pub start: String,
    pub end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_price_cents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<CalendarEvent> for CalendarEventDto {
    fn from(event: CalendarEvent) -> Self {
        let title = event.title();
        let kind = event.kind();
        match event {
            CalendarEvent::Booking {
                id,
                resource_id,
                resource_name,
                user_id,
                span,
                total_price_cents,
            } => CalendarEventDto {
                kind,
                id,
                resource_id,
                resource_name,
                title,
                start: format_timestamp(span.start),
                end: format_timestamp(span.end),
                user_id: Some(user_id),
                total_price_cents: Some(total_price_cents),
                reason: None,
            },
            CalendarEvent::Block {
                id,
                resource_id,
                resource_name,
                span,
                reason,
            } => CalendarEventDto {
                kind,
                id,
                resource_id,
                resource_name,
                title,
                start: format_timestamp(span.start),
                end: format_timestamp(span.end),
                user_id: None,
                total_price_cents: None,
                reason: Some(reason),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResourcePageDto {
    pub resources: Vec<ResourceDto>,
    pub total: usize,
}

impl From<ResourcePage> for ResourcePageDto {
    fn from(page: ResourcePage) -> Self {
        ResourcePageDto {
            resources: page.resources.into_iter().map(ResourceDto::from).collect(),
            total: page.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TypeRevenueDto {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub bookings: u64,
    pub revenue_cents: u64,
}

impl From<TypeRevenue> for TypeRevenueDto {
    fn from(r: TypeRevenue) -> Self {
        TypeRevenueDto {
            resource_type: r.resource_type,
            bookings: r.bookings,
            revenue_cents: r.revenue_cents,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MonthlyBookingsDto {
    /// `YYYY-MM`
    pub month: String,
    pub confirmed: u64,
    pub cancelled: u64,
    pub revenue_cents: u64,
}

impl From<MonthlyBookings> for MonthlyBookingsDto {
    fn from(m: MonthlyBookings) -> Self {
        MonthlyBookingsDto {
            month: format!("{:04}-{:02}", m.year, m.month),
            confirmed: m.confirmed,
            cancelled: m.cancelled,
            revenue_cents: m.revenue_cents,
        }
    }
}

fn snapshot_value(snapshot: Snapshot) -> Result<Value, EngineError> {
    match snapshot {
        Snapshot::Resource(r) => to_value(ResourceDto::from(r)),
        Snapshot::Booking(b) => to_value(BookingDto::from(b)),
        Snapshot::Block(b) => to_value(BlockDto::from(b)),
    }
}

#[derive(Debug, Serialize)]
pub struct ChangeDto {
    pub resource_id: Ulid,
    pub entity: EntityKind,
    pub entity_id: Ulid,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub at: String,
}

impl TryFrom<Change> for ChangeDto {
    type Error = EngineError;

    fn try_from(c: Change) -> Result<Self, EngineError> {
        Ok(ChangeDto {
            resource_id: c.resource_id,
            entity: c.entity,
            entity_id: c.entity_id,
            action: c.action,
            actor: c.actor,
            before: c.before.map(snapshot_value).transpose()?,
            after: c.after.map(snapshot_value).transpose()?,
            at: format_timestamp(c.at),
        })
    }
}

#[derive(Debug, Serialize)]
struct ConflictDto {
    resource_id: Ulid,
    with: Ulid,
    kind: IntervalKind,
    start: String,
    end: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<ConflictDto>,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        let conflict = match e {
            EngineError::Conflict {
                resource_id,
                with,
                kind,
                span,
            } => Some(ConflictDto {
                resource_id: *resource_id,
                with: *with,
                kind: *kind,
                start: format_timestamp(span.start),
                end: format_timestamp(span.end),
            }),
            _ => None,
        };
        ErrorBody {
            kind: e.kind().as_str(),
            message: e.to_string(),
            conflict,
        }
    }
}

fn to_value<T: Serialize>(data: T) -> Result<Value, EngineError> {
    serde_json::to_value(data).map_err(|e| EngineError::Internal(format!("encode reply: {e}")))
}

fn many<T, D: From<T> + Serialize>(items: Vec<T>) -> Result<Value, EngineError> {
    to_value(items.into_iter().map(D::from).collect::<Vec<D>>())
}

/// Render a pushed change record as one line.
pub fn render_change(change: Change) -> String {
    match ChangeDto::try_from(change).and_then(to_value) {
        Ok(data) => json!({ "event": "change", "data": data }),
        Err(e) => json!({ "event": "error", "error": ErrorBody::from(&e) }),
    }
    .to_string()
}

/// Tell a watcher it fell behind and `missed` changes were dropped.
pub fn render_lagged(missed: u64) -> String {
    json!({ "event": "lagged", "missed": missed }).to_string()
}

/// Render a result as one reply line (without the trailing newline).
pub fn render(result: Result<Value, EngineError>) -> String {
    match result {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(e) => json!({ "ok": false, "error": ErrorBody::from(&e) }),
    }
    .to_string()
}

// ── Dispatch ─────────────────────────────────────────────────────

pub async fn execute(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::CreateResource { fields } => {
            to_value(ResourceDto::from(engine.create_resource(fields.into()).await?))
        }
        Request::UpdateResource { id, fields } => {
            let patch = ResourcePatch::from(fields);
            to_value(ResourceDto::from(engine.update_resource(id, patch).await?))
        }
        Request::DeleteResource { id } => to_value(ResourceDto::from(engine.delete_resource(id).await?)),
        Request::GetResource { id } => to_value(ResourceDto::from(engine.get_resource(id).await?)),
        Request::ListResources {
            resource_type,
            status,
            search,
            offset,
            limit,
        } => {
            let filter = ResourceFilter {
                resource_type,
                status,
                search,
                offset: offset.unwrap_or(0),
                limit,
            };
            to_value(ResourcePageDto::from(engine.list_resources(&filter).await?))
        }
        Request::ResourceTypes => to_value(engine.resource_types().await),
        Request::CreateBooking {
            resource_id,
            user_id,
            start,
            end,
        } => {
            let (start, end) = interval_bounds(&start, &end)?;
            to_value(BookingDto::from(
                engine.create_booking(resource_id, &user_id, start, end).await?,
            ))
        }
        Request::CancelBooking {
            booking_id,
            actor_id,
        } => to_value(BookingDto::from(engine.cancel_booking(booking_id, &actor_id).await?)),
        Request::GetBooking { id } => to_value(BookingDto::from(engine.get_booking(id).await?)),
        Request::ListBookings {
            resource_id,
            user_id,
            status,
        } => {
            let filter = BookingFilter {
                resource_id,
                user_id,
                status,
            };
            many::<_, BookingDto>(engine.list_bookings(&filter).await?)
        }
        Request::CreateBlock {
            resource_id,
            start,
            end,
            reason,
            created_by,
        } => {
            let (start, end) = interval_bounds(&start, &end)?;
            to_value(BlockDto::from(
                engine
                    .create_block(resource_id, start, end, &reason, &created_by)
                    .await?,
            ))
        }
        Request::DeleteBlock { block_id } => to_value(BlockDto::from(engine.delete_block(block_id).await?)),
        Request::ListBlocks { resource_id } => many::<_, BlockDto>(engine.list_blocks(resource_id).await?),
        Request::GetCalendar {
            resource_id,
            start,
            end,
        } => {
            let (start, end) = window_bounds(&start, &end)?;
            many::<_, CalendarEventDto>(engine.get_calendar(resource_id, start, end).await?)
        }
        Request::IsFree {
            resource_id,
            start,
            end,
            exclude_booking_id,
        } => {
            let (start, end) = interval_bounds(&start, &end)?;
            let free = engine.is_free(resource_id, start, end, exclude_booking_id).await?;
            Ok(json!({ "free": free }))
        }
        Request::FreeSlots {
            resource_id,
            start,
            end,
            min_duration_minutes,
        } => {
            let (start, end) = window_bounds(&start, &end)?;
            let min_duration_ms = match min_duration_minutes {
                Some(m) => Some(
                    m.checked_mul(60_000)
                        .ok_or_else(|| EngineError::validation("min_duration_minutes out of range"))?,
                ),
                None => None,
            };
            many::<_, SpanDto>(
                engine
                    .free_slots(resource_id, start, end, min_duration_ms)
                    .await?,
            )
        }
        Request::AvailableResources {
            start,
            end,
            resource_type,
        } => {
            let (start, end) = interval_bounds(&start, &end)?;
            many::<_, ResourceDto>(
                engine
                    .available_resources(start, end, resource_type.as_deref())
                    .await?,
            )
        }
        Request::RevenueByType => many::<_, TypeRevenueDto>(engine.revenue_by_type().await),
        Request::BookingsByMonth { months, until } => {
            let until = match until {
                Some(until) => parse_window_bound("until", &until)?,
                None => now_ms(),
            };
            many::<_, MonthlyBookingsDto>(
                engine
                    .bookings_by_month(months.unwrap_or(DEFAULT_REPORT_MONTHS), until)
                    .await?,
            )
        }
        Request::Watch { .. } => Err(EngineError::validation(
            "watch is only available on a client connection",
        )),
    }
}
