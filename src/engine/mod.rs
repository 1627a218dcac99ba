mod analytics;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_spans, merge_overlapping, occupied_spans, subtract_intervals};
pub use conflict::{find_conflict, is_free};
pub(crate) use conflict::now_ms;
pub use error::{EngineError, ErrorKind};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

/// One resource: its exclusive mutation section and its in-memory state.
///
/// The section serializes check-then-commit (including the WAL append).
/// The state lock is only write-held for the in-memory apply, so readers
/// never wait on disk I/O.
pub struct ResourceSlot {
    pub id: Ulid,
    section: Mutex<()>,
    state: RwLock<ResourceState>,
}

impl ResourceSlot {
    fn new(state: ResourceState) -> Self {
        Self {
            id: state.id,
            section: Mutex::new(()),
            state: RwLock::new(state),
        }
    }

    /// Consistent snapshot of the resource. Never blocks behind a WAL write.
    pub async fn read(&self) -> RwLockReadGuard<'_, ResourceState> {
        self.state.read().await
    }
}

pub type SharedResource = Arc<ResourceSlot>;

/// Held for the whole check-then-commit of one mutation.
pub(super) struct Section<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    _section: MutexGuard<'a, ()>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!(error = %e, events = batch.len(), "WAL batch failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch is cut off the file so it never sits in front of later records.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!(error = %e, "WAL rollback failed");
    }
    result
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub resources: DashMap<Ulid, SharedResource>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking/block id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) config: EngineConfig,
    /// Mutations hold this shared; WAL compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event to a ResourceState. Caller holds the write lock.
/// ResourceCreated/Deleted are handled at the map level.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            resource_type,
            capacity,
            hourly_rate_cents,
            status,
            ..
        } => rs.apply_draft(ResourceDraft {
            name: name.clone(),
            resource_type: resource_type.clone(),
            capacity: *capacity,
            hourly_rate_cents: *hourly_rate_cents,
            status: *status,
        }),
        Event::BookingConfirmed {
            id,
            resource_id,
            user_id,
            span,
            total_price_cents,
            created_at,
        } => {
            rs.insert_interval(Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Booking,
            });
            rs.bookings.insert(
                *id,
                Booking {
                    id: *id,
                    resource_id: *resource_id,
                    user_id: user_id.clone(),
                    span: *span,
                    status: BookingStatus::Confirmed,
                    total_price_cents: *total_price_cents,
                    created_at: *created_at,
                    cancelled_at: None,
                    cancelled_by: None,
                },
            );
            entity_map.insert(*id, *resource_id);
        }
        Event::BookingCancelled {
            id,
            cancelled_by,
            cancelled_at,
            ..
        } => {
            // Cancelled bookings keep their record (and reverse lookup); only
            // the occupation goes away.
            rs.remove_interval(*id);
            if let Some(booking) = rs.bookings.get_mut(id) {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
                booking.cancelled_by = Some(cancelled_by.clone());
            }
        }
        Event::BlockCreated {
            id,
            resource_id,
            span,
            reason,
            created_by,
            created_at,
        } => {
            rs.insert_interval(Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Block,
            });
            rs.blocks.insert(
                *id,
                ResourceBlock {
                    id: *id,
                    resource_id: *resource_id,
                    span: *span,
                    reason: reason.clone(),
                    created_by: created_by.clone(),
                    created_at: *created_at,
                },
            );
            entity_map.insert(*id, *resource_id);
        }
        Event::BlockDeleted { id, .. } => {
            rs.remove_interval(*id);
            rs.blocks.remove(id);
            entity_map.remove(id);
        }
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

/// Drop reverse-lookup entries for everything a removed resource owned.
fn forget_resource(rs: &ResourceState, entity_map: &DashMap<Ulid, Ulid>) {
    for id in rs.bookings.keys().chain(rs.blocks.keys()) {
        entity_map.remove(id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_resource = DashMap::new();
        let mut states: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    resource_type,
                    capacity,
                    hourly_rate_cents,
                    status,
                } => {
                    let draft = ResourceDraft {
                        name: name.clone(),
                        resource_type: resource_type.clone(),
                        capacity: *capacity,
                        hourly_rate_cents: *hourly_rate_cents,
                        status: *status,
                    };
                    states.insert(*id, ResourceState::new(*id, draft));
                }
                Event::ResourceDeleted { id } => {
                    if let Some(rs) = states.remove(id) {
                        forget_resource(&rs, &entity_to_resource);
                    }
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(rs) = states.get_mut(&resource_id)
                    {
                        apply_to_resource(rs, other, &entity_to_resource);
                    }
                }
            }
        }

        let resources = DashMap::new();
        for (id, rs) in states {
            resources.insert(id, Arc::new(ResourceSlot::new(rs)));
        }
        if !events.is_empty() {
            info!(
                events = events.len(),
                resources = resources.len(),
                path = %wal_path.display(),
                "replayed WAL"
            );
        }

        Ok(Self {
            resources,
            wal_tx,
            notify,
            entity_to_resource,
            config,
            compaction_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn slot(&self, id: &Ulid) -> Result<SharedResource, EngineError> {
        self.resources
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn resource_for_entity(&self, entity_id: &Ulid) -> Result<Ulid, EngineError> {
        self.entity_to_resource
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))
    }

    /// Wait for a lock with the configured timeout, retrying once before
    /// giving up with `Retryable`.
    async fn timed_acquire<G, F>(
        &self,
        resource_id: Ulid,
        lock: &'static str,
        mut acquire: impl FnMut() -> F,
    ) -> Result<G, EngineError>
    where
        F: Future<Output = G>,
    {
        for attempt in 1..=2 {
            match tokio::time::timeout(self.config.lock_timeout, acquire()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => warn!(resource_id = %resource_id, attempt, lock, "timed out waiting for lock"),
            }
        }
        metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        Err(EngineError::Retryable(resource_id))
    }

    /// Shared hold on the compaction gate. Bounded like the section, since a
    /// running compaction excludes every mutation.
    pub(super) async fn enter_gate(&self, resource_id: Ulid) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.timed_acquire(resource_id, "compaction_gate", || self.compaction_gate.read())
            .await
    }

    /// Acquire the compaction gate, then the resource's exclusive section.
    pub(super) async fn enter_section<'a>(
        &'a self,
        slot: &'a ResourceSlot,
    ) -> Result<Section<'a>, EngineError> {
        let started = Instant::now();
        let gate = self.enter_gate(slot.id).await?;
        let section = self
            .timed_acquire(slot.id, "section", || slot.section.lock())
            .await?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(Section {
            _gate: gate,
            _section: section,
        })
    }

    /// Inside a section: the slot must still be the registered one. A delete
    /// may have won the race for the section.
    pub(super) fn ensure_live(&self, slot: &SharedResource) -> Result<(), EngineError> {
        match self.resources.get(&slot.id) {
            Some(current) if Arc::ptr_eq(current.value(), slot) => Ok(()),
            _ => Err(EngineError::NotFound(slot.id)),
        }
    }

    /// WAL-append + apply + notify. Caller holds the section.
    pub(super) async fn persist_and_apply(
        &self,
        slot: &ResourceSlot,
        event: &Event,
        change: Change,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        {
            let mut rs = slot.state.write().await;
            apply_to_resource(&mut rs, event, &self.entity_to_resource);
        }
        debug!(resource_id = %slot.id, entity_id = %change.entity_id, action = ?change.action, "committed");
        self.notify.send(&change);
        Ok(())
    }
}

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingConfirmed { resource_id, .. }
        | Event::BookingCancelled { resource_id, .. }
        | Event::BlockCreated { resource_id, .. }
        | Event::BlockDeleted { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}
