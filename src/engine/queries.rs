use std::collections::BTreeSet;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::MAX_PAGE_LIMIT;
use crate::model::*;

use super::availability::free_spans;
use super::conflict::{find_conflict, validate_interval, validate_window};
use super::{Engine, EngineError, SharedResource};

/// Calendar entries for one resource inside `window`.
fn calendar_entries(rs: &ResourceState, window: &Span, out: &mut Vec<CalendarEvent>) {
    for interval in rs.overlapping(window) {
        match interval.kind {
            IntervalKind::Booking => {
                if let Some(b) = rs.bookings.get(&interval.id) {
                    out.push(CalendarEvent::Booking {
                        id: b.id,
                        resource_id: rs.id,
                        resource_name: rs.name.clone(),
                        user_id: b.user_id.clone(),
                        span: b.span,
                        total_price_cents: b.total_price_cents,
                    });
                }
            }
            IntervalKind::Block => {
                if let Some(b) = rs.blocks.get(&interval.id) {
                    out.push(CalendarEvent::Block {
                        id: b.id,
                        resource_id: rs.id,
                        resource_name: rs.name.clone(),
                        span: b.span,
                        reason: b.reason.clone(),
                    });
                }
            }
        }
    }
}

impl Engine {
    /// All slots, in id order.
    pub(super) fn all_slots(&self) -> Vec<SharedResource> {
        let mut slots: Vec<SharedResource> = self.resources.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.id);
        slots
    }

    fn scope(&self, resource_id: Option<Ulid>) -> Result<Vec<SharedResource>, EngineError> {
        match resource_id {
            Some(id) => Ok(vec![self.slot(&id)?]),
            None => Ok(self.all_slots()),
        }
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        Ok(self.slot(&id)?.read().await.info())
    }

    /// Resources matching `filter`, sorted by name, then paged.
    pub async fn list_resources(&self, filter: &ResourceFilter) -> Result<ResourcePage, EngineError> {
        if let Some(limit) = filter.limit
            && !(1..=MAX_PAGE_LIMIT).contains(&limit)
        {
            return Err(EngineError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut matched = Vec::new();
        for slot in self.all_slots() {
            let rs = slot.read().await;
            if filter.resource_type.as_deref().is_some_and(|t| t != rs.resource_type) {
                continue;
            }
            if filter.status.is_some_and(|s| s != rs.status) {
                continue;
            }
            if let Some(needle) = &needle
                && !rs.name.to_lowercase().contains(needle)
                && !rs.resource_type.to_lowercase().contains(needle)
            {
                continue;
            }
            matched.push(rs.info());
        }
        matched.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let total = matched.len();
        let resources = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ResourcePage { resources, total })
    }

    /// Distinct resource types, sorted.
    pub async fn resource_types(&self) -> Vec<String> {
        let mut types = BTreeSet::new();
        for slot in self.all_slots() {
            types.insert(slot.read().await.resource_type.clone());
        }
        types.into_iter().collect()
    }

    /// Subscribe to committed changes on one resource, or on every
    /// resource when `resource_id` is `None`.
    pub fn watch(&self, resource_id: Option<Ulid>) -> Result<broadcast::Receiver<Change>, EngineError> {
        match resource_id {
            Some(id) => {
                self.slot(&id)?;
                Ok(self.notify.subscribe(id))
            }
            None => Ok(self.notify.subscribe_all()),
        }
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let resource_id = self.resource_for_entity(&id)?;
        let slot = self.slot(&resource_id)?;
        let rs = slot.read().await;
        rs.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching `filter`, cancelled ones included unless filtered out,
    /// sorted by start.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        for slot in self.scope(filter.resource_id)? {
            let rs = slot.read().await;
            out.extend(
                rs.bookings
                    .values()
                    .filter(|b| filter.user_id.as_deref().is_none_or(|u| u == b.user_id))
                    .filter(|b| filter.status.is_none_or(|s| s == b.status))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    pub async fn list_blocks(&self, resource_id: Option<Ulid>) -> Result<Vec<ResourceBlock>, EngineError> {
        let mut out = Vec::new();
        for slot in self.scope(resource_id)? {
            out.extend(slot.read().await.blocks.values().cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Whether `[start, end)` is free on a resource, ignoring `exclude_booking`.
    pub async fn is_free(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_booking: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_interval(start, end)?;
        let slot = self.slot(&resource_id)?;
        let rs = slot.read().await;
        Ok(find_conflict(&rs, &span, exclude_booking).is_none())
    }

    /// Confirmed bookings and blocks intersecting the window, for one resource
    /// or all of them, sorted by start. Each resource is read under its own
    /// snapshot; the result is not atomic across resources.
    pub async fn get_calendar(
        &self,
        resource_id: Option<Ulid>,
        window_start: Ms,
        window_end: Ms,
    ) -> Result<Vec<CalendarEvent>, EngineError> {
        let window = validate_window(window_start, window_end)?;
        let mut out = Vec::new();
        for slot in self.scope(resource_id)? {
            calendar_entries(&*slot.read().await, &window, &mut out);
        }
        out.sort_by_key(|e| (e.span().start, e.resource_id(), e.id()));
        Ok(out)
    }

    pub async fn free_slots(
        &self,
        resource_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(window_start, window_end)?;
        if min_duration_ms.is_some_and(|d| d <= 0) {
            return Err(EngineError::validation("min_duration must be positive"));
        }
        let slot = self.slot(&resource_id)?;
        let rs = slot.read().await;
        Ok(free_spans(&rs, &window, min_duration_ms))
    }

    /// AVAILABLE resources (optionally of one type) with nothing booked or
    /// blocked during `[start, end)`.
    pub async fn available_resources(
        &self,
        start: Ms,
        end: Ms,
        resource_type: Option<&str>,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        let span = validate_interval(start, end)?;
        let mut out = Vec::new();
        for slot in self.all_slots() {
            let rs = slot.read().await;
            if rs.status != ResourceStatus::Available
                || resource_type.is_some_and(|t| t != rs.resource_type)
            {
                continue;
            }
            if find_conflict(&rs, &span, None).is_none() {
                out.push(rs.info());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
