use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::config::CancellationPolicy;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, limit_text, now_ms, require_text, validate_interval};
use super::{forget_resource, Engine, EngineError, ResourceSlot, WalCommand};

fn validate_draft(draft: &ResourceDraft) -> Result<(), EngineError> {
    require_text("name", &draft.name, MAX_NAME_LEN)?;
    require_text("type", &draft.resource_type, MAX_TYPE_LEN)
}

fn check_interval_room(rs: &ResourceState) -> Result<(), EngineError> {
    if rs.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many intervals on resource"));
    }
    Ok(())
}

fn count_conflict(result: Result<(), EngineError>) -> Result<(), EngineError> {
    if matches!(result, Err(EngineError::Conflict { .. })) {
        metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    }
    result
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, draft: ResourceDraft) -> Result<ResourceInfo, EngineError> {
        validate_draft(&draft)?;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let id = Ulid::new();
        let event = Event::resource_created(id, &draft);
        let _gate = self.enter_gate(id).await?;
        self.wal_append(&event).await?;

        let rs = ResourceState::new(id, draft);
        let info = rs.info();
        self.resources.insert(id, Arc::new(ResourceSlot::new(rs)));
        self.notify.send(&Change {
            resource_id: id,
            entity: EntityKind::Resource,
            entity_id: id,
            action: ChangeAction::Created,
            actor: None,
            before: None,
            after: Some(Snapshot::Resource(info.clone())),
            at: now_ms(),
        });
        info!(resource_id = %id, name = %info.name, "resource created");
        Ok(info)
    }

    /// Update a resource's descriptive fields and status. Fields the patch
    /// leaves out keep their current values.
    pub async fn update_resource(
        &self,
        id: Ulid,
        patch: impl Into<ResourcePatch>,
    ) -> Result<ResourceInfo, EngineError> {
        let patch = patch.into();
        let slot = self.slot(&id)?;
        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        let (before, draft) = {
            let rs = slot.read().await;
            (rs.info(), rs.patched(patch))
        };
        validate_draft(&draft)?;
        let event = Event::resource_updated(id, &draft);
        let after = ResourceInfo {
            id,
            name: draft.name,
            resource_type: draft.resource_type,
            capacity: draft.capacity,
            hourly_rate_cents: draft.hourly_rate_cents,
            status: draft.status,
        };
        let change = Change {
            resource_id: id,
            entity: EntityKind::Resource,
            entity_id: id,
            action: ChangeAction::Updated,
            actor: None,
            before: Some(Snapshot::Resource(before)),
            after: Some(Snapshot::Resource(after.clone())),
            at: now_ms(),
        };
        self.persist_and_apply(&slot, &event, change).await?;
        Ok(after)
    }

    /// Remove a resource and its blocks. Refused while any booking record exists.
    pub async fn delete_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let slot = self.slot(&id)?;
        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        let before = {
            let rs = slot.read().await;
            if !rs.bookings.is_empty() {
                return Err(EngineError::InUse(id));
            }
            rs.info()
        };

        self.wal_append(&Event::ResourceDeleted { id }).await?;
        if let Some((_, removed)) = self.resources.remove(&id) {
            forget_resource(&*removed.read().await, &self.entity_to_resource);
        }
        self.notify.send(&Change {
            resource_id: id,
            entity: EntityKind::Resource,
            entity_id: id,
            action: ChangeAction::Deleted,
            actor: None,
            before: Some(Snapshot::Resource(before.clone())),
            after: None,
            at: now_ms(),
        });
        self.notify.remove(&id);
        info!(resource_id = %id, "resource deleted");
        Ok(before)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book `[start, end)` on a resource for `user_id`.
    ///
    /// Cheap checks run first without the section. The authoritative
    /// existence/status/overlap check runs again inside it, immediately
    /// before the commit.
    pub async fn create_booking(
        &self,
        resource_id: Ulid,
        user_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_interval(start, end)?;
        require_text("user_id", user_id, MAX_ACTOR_LEN)?;
        let slot = self.slot(&resource_id)?;
        if slot.read().await.status == ResourceStatus::Maintenance {
            return Err(EngineError::Maintenance(resource_id));
        }

        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        let booking = {
            let rs = slot.read().await;
            if rs.status == ResourceStatus::Maintenance {
                return Err(EngineError::Maintenance(resource_id));
            }
            check_interval_room(&rs)?;
            count_conflict(check_no_conflict(&rs, &span, None))?;
            Booking {
                id: Ulid::new(),
                resource_id,
                user_id: user_id.to_string(),
                span,
                status: BookingStatus::Confirmed,
                total_price_cents: total_price_cents(&span, rs.hourly_rate_cents),
                created_at: now_ms(),
                cancelled_at: None,
                cancelled_by: None,
            }
        };

        let event = Event::BookingConfirmed {
            id: booking.id,
            resource_id,
            user_id: booking.user_id.clone(),
            span,
            total_price_cents: booking.total_price_cents,
            created_at: booking.created_at,
        };
        let change = Change {
            resource_id,
            entity: EntityKind::Booking,
            entity_id: booking.id,
            action: ChangeAction::Created,
            actor: Some(booking.user_id.clone()),
            before: None,
            after: Some(Snapshot::Booking(booking.clone())),
            at: booking.created_at,
        };
        self.persist_and_apply(&slot, &event, change).await?;
        Ok(booking)
    }

    /// Cancel a booking. Cancelling an already-cancelled booking returns it
    /// unchanged and writes nothing.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        require_text("actor", actor, MAX_ACTOR_LEN)?;
        let resource_id = self.resource_for_entity(&booking_id)?;
        let slot = self.slot(&resource_id)?;
        match slot.read().await.bookings.get(&booking_id) {
            None => return Err(EngineError::NotFound(booking_id)),
            Some(b) if !b.is_confirmed() => return Ok(b.clone()),
            Some(_) => {}
        }

        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        let before = match slot.read().await.bookings.get(&booking_id) {
            None => return Err(EngineError::NotFound(booking_id)),
            Some(b) if !b.is_confirmed() => return Ok(b.clone()),
            Some(b) => b.clone(),
        };

        let now = now_ms();
        if self.config.cancellation_policy == CancellationPolicy::FutureOnly && before.span.start <= now {
            return Err(EngineError::CancellationClosed {
                booking_id,
                start: before.span.start,
            });
        }

        let after = Booking {
            status: BookingStatus::Cancelled,
            cancelled_at: Some(now),
            cancelled_by: Some(actor.to_string()),
            ..before.clone()
        };
        let event = Event::BookingCancelled {
            id: booking_id,
            resource_id,
            cancelled_by: actor.to_string(),
            cancelled_at: now,
        };
        let change = Change {
            resource_id,
            entity: EntityKind::Booking,
            entity_id: booking_id,
            action: ChangeAction::Cancelled,
            actor: Some(actor.to_string()),
            before: Some(Snapshot::Booking(before)),
            after: Some(Snapshot::Booking(after.clone())),
            at: now,
        };
        self.persist_and_apply(&slot, &event, change).await?;
        Ok(after)
    }

    // ── Blocks ───────────────────────────────────────────────

    /// Block `[start, end)` on a resource. Refused if anything already
    /// occupies part of the interval. Allowed under maintenance.
    pub async fn create_block(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        reason: &str,
        created_by: &str,
    ) -> Result<ResourceBlock, EngineError> {
        let span = validate_interval(start, end)?;
        limit_text("reason", reason, MAX_REASON_LEN)?;
        require_text("created_by", created_by, MAX_ACTOR_LEN)?;
        let slot = self.slot(&resource_id)?;

        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        {
            let rs = slot.read().await;
            check_interval_room(&rs)?;
            count_conflict(check_no_conflict(&rs, &span, None))?;
        }

        let block = ResourceBlock {
            id: Ulid::new(),
            resource_id,
            span,
            reason: reason.to_string(),
            created_by: created_by.to_string(),
            created_at: now_ms(),
        };
        let event = Event::BlockCreated {
            id: block.id,
            resource_id,
            span,
            reason: block.reason.clone(),
            created_by: block.created_by.clone(),
            created_at: block.created_at,
        };
        let change = Change {
            resource_id,
            entity: EntityKind::Block,
            entity_id: block.id,
            action: ChangeAction::Created,
            actor: Some(block.created_by.clone()),
            before: None,
            after: Some(Snapshot::Block(block.clone())),
            at: block.created_at,
        };
        self.persist_and_apply(&slot, &event, change).await?;
        Ok(block)
    }

    /// Remove a block. Never touches bookings.
    pub async fn delete_block(&self, block_id: Ulid) -> Result<ResourceBlock, EngineError> {
        let resource_id = self.resource_for_entity(&block_id)?;
        let slot = self.slot(&resource_id)?;

        let _section = self.enter_section(&slot).await?;
        self.ensure_live(&slot)?;

        let before = slot
            .read()
            .await
            .blocks
            .get(&block_id)
            .cloned()
            .ok_or(EngineError::NotFound(block_id))?;
        let event = Event::BlockDeleted {
            id: block_id,
            resource_id,
        };
        let change = Change {
            resource_id,
            entity: EntityKind::Block,
            entity_id: block_id,
            action: ChangeAction::Deleted,
            actor: None,
            before: Some(Snapshot::Block(before.clone())),
            after: None,
            at: now_ms(),
        };
        self.persist_and_apply(&slot, &event, change).await?;
        Ok(before)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds current
    /// state, cancelled booking history included. Excludes all mutations
    /// while it runs.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let slots: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for slot in slots {
            let rs = slot.read().await;
            let draft = ResourceDraft {
                name: rs.name.clone(),
                resource_type: rs.resource_type.clone(),
                capacity: rs.capacity,
                hourly_rate_cents: rs.hourly_rate_cents,
                status: rs.status,
            };
            events.push(Event::resource_created(rs.id, &draft));

            let mut bookings: Vec<&Booking> = rs.bookings.values().collect();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            for b in bookings {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    resource_id: rs.id,
                    user_id: b.user_id.clone(),
                    span: b.span,
                    total_price_cents: b.total_price_cents,
                    created_at: b.created_at,
                });
                if let (Some(cancelled_at), Some(cancelled_by)) = (b.cancelled_at, &b.cancelled_by) {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        resource_id: rs.id,
                        cancelled_by: cancelled_by.clone(),
                        cancelled_at,
                    });
                }
            }

            let mut blocks: Vec<&ResourceBlock> = rs.blocks.values().collect();
            blocks.sort_by_key(|b| (b.created_at, b.id));
            for b in blocks {
                events.push(Event::BlockCreated {
                    id: b.id,
                    resource_id: rs.id,
                    span: b.span,
                    reason: b.reason.clone(),
                    created_by: b.created_by.clone(),
                    created_at: b.created_at,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
