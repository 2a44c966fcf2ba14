mod conflict;
mod error;
mod lifecycle;
mod queries;
mod request;
#[cfg(test)]
mod tests;
mod validate;

pub use conflict::{find_conflict, ConflictScope};
pub use error::EngineError;
pub use lifecycle::{transition_actor, Actor};
pub use queries::{DayCount, RoomCount, Statistics};
pub use request::{BookingPatch, BookingQuery, BookingRequest, Period, RoomPatch, RoomSpec, SortField};
pub use validate::parse_instant;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::documents::DocumentStore;
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
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
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before compacting or reporting.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// In-memory booking state, one lock per room, made durable by the WAL.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Serializes room registration against compaction.
    pub(super) registration: Mutex<()>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) documents: Arc<dyn DocumentStore>,
    /// Zone for calendar-day grouping in statistics and for rooms registered without one.
    pub(super) default_tz: Tz,
}

/// Apply an event to one room. The caller holds the room's write lock.
/// A booking move touches two rooms; each receives the same event.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated { room } => rs.room = room.clone(),
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.room_id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingEdited { booking, .. } => {
            rs.remove_booking(booking.id);
            if rs.room.id == booking.room_id {
                index.insert(booking.id, booking.room_id);
                rs.insert_booking(booking.clone());
            }
        }
        Event::BookingStatusChanged { id, change, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = change.to;
                b.updated_at = change.at;
                b.history.push(change.clone());
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
        // Registration is handled at the map level.
        Event::RoomRegistered { .. } => {}
    }
}

/// Rooms an event must be applied to.
fn event_room_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::RoomRegistered { room } | Event::RoomUpdated { room } => vec![room.id],
        Event::BookingCreated { booking } => vec![booking.room_id],
        Event::BookingEdited {
            previous_room_id,
            booking,
        } if *previous_room_id != booking.room_id => vec![*previous_room_id, booking.room_id],
        Event::BookingEdited { booking, .. } => vec![booking.room_id],
        Event::BookingStatusChanged { room_id, .. } | Event::BookingDeleted { room_id, .. } => {
            vec![*room_id]
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        documents: Arc<dyn DocumentStore>,
        default_tz: Tz,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            wal_tx,
            booking_to_room: DashMap::new(),
            registration: Mutex::new(()),
            notifier,
            documents,
            default_tz,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            if let Event::RoomRegistered { room } = event {
                engine
                    .rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                continue;
            }
            for room_id in event_room_ids(event) {
                if let Some(entry) = engine.rooms.get(&room_id) {
                    let rs = entry.clone();
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_to_room(&mut guard, event, &engine.booking_to_room);
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} rooms, {} bookings",
            events.len(),
            engine.rooms.len(),
            engine.booking_to_room.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL write failed: {e}")))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        Ok(())
    }

    /// Lookup booking → room, acquire the room's write lock.
    ///
    /// The index is re-checked under the lock: a concurrent move may have
    /// taken the booking elsewhere while we waited.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        loop {
            let room_id = self
                .room_for_booking(booking_id)
                .ok_or_else(|| EngineError::booking_not_found(booking_id))?;
            let rs = self
                .get_room(&room_id)
                .ok_or_else(|| EngineError::booking_not_found(booking_id))?;
            let guard = rs.write_owned().await;
            if guard.booking(*booking_id).is_some() {
                return Ok(guard);
            }
            if self.room_for_booking(booking_id) == Some(room_id) {
                return Err(EngineError::booking_not_found(booking_id));
            }
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Read locks on every room are held until the swap completes so no
    /// append can land in the file being replaced. Taken in id order, the
    /// same order a booking move uses.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registration = self.registration.lock().await;
        let mut room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();

        let mut guards = Vec::with_capacity(room_ids.len());
        let mut events = Vec::new();
        for id in room_ids {
            let Some(rs) = self.get_room(&id) else { continue };
            let guard = rs.read_owned().await;
            events.push(Event::RoomRegistered {
                room: guard.room.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            guards.push(guard);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL compaction failed: {e}")))?;
        drop(guards);
        tracing::info!("WAL compacted to {count} events");
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
