//! Every state change: room registration, booking creation and edits, the
//! status state machine, and deletion. Each operation takes the affected
//! room's write lock for its whole validate → check → persist sequence.

use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::documents::{DocumentError, Upload};
use crate::limits::*;
use crate::model::*;
use crate::notify::StatusNotice;
use crate::observability::{BOOKINGS_CREATED_TOTAL, NOTIFY_FAILURES_TOTAL, TRANSITIONS_TOTAL};

use super::conflict::{check_no_conflict, ConflictScope};
use super::request::{BookingPatch, BookingRequest, RoomPatch, RoomSpec};
use super::validate::*;
use super::{apply_to_room, now_ms, Engine, EngineError};

/// Who may drive a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Owner,
    Admin,
}

/// The transition table. `None` means the move is never allowed.
pub fn transition_actor(from: BookingStatus, to: BookingStatus) -> Option<Actor> {
    use BookingStatus::*;
    match (from, to) {
        (Pending, Approved) | (Pending, Rejected) | (Approved, Completed) => Some(Actor::Admin),
        (Pending, Cancelled) | (Approved, Cancelled) => Some(Actor::Owner),
        _ => None,
    }
}

fn document_error(e: DocumentError) -> EngineError {
    match e {
        DocumentError::TooLarge(_) | DocumentError::Empty => EngineError::InvalidInput(e.to_string()),
        DocumentError::Io(_) => EngineError::Internal(e.to_string()),
    }
}

fn capacity_from(raw: i64) -> Result<u32, EngineError> {
    u32::try_from(raw)
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| EngineError::invalid("capacity must be a positive integer"))
}

fn check_room(room: &Room) -> Result<(), EngineError> {
    if room.name.trim().is_empty() {
        return Err(EngineError::invalid("room name cannot be empty"));
    }
    check_text("name", Some(room.name.as_str()), MAX_ROOM_NAME_LEN)?;
    check_text("location", room.location.as_deref(), MAX_TEXT_LEN)?;
    check_text("image", room.image.as_deref(), MAX_TEXT_LEN)?;
    room.timezone
        .parse::<Tz>()
        .map_err(|_| EngineError::invalid(format!("unknown time zone: {}", room.timezone)))?;
    Ok(())
}

type RoomGuard = OwnedRwLockWriteGuard<RoomState>;

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn register_room(&self, caller: &Caller, spec: RoomSpec) -> Result<Room, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can register rooms"));
        }
        let (Some(name), Some(capacity)) = (spec.name, spec.capacity) else {
            return Err(EngineError::invalid("missing required fields: name, capacity"));
        };
        let hours = OperatingHours::parse(
            spec.open_time.as_deref().unwrap_or("08:00"),
            spec.close_time.as_deref().unwrap_or("17:00"),
        )
        .map_err(EngineError::InvalidInput)?;
        let room = Room {
            id: spec.id.unwrap_or_else(Ulid::new),
            name: name.trim().to_string(),
            capacity: capacity_from(capacity)?,
            location: spec.location,
            active: spec.active.unwrap_or(true),
            hours,
            timezone: spec
                .timezone
                .unwrap_or_else(|| self.default_tz.name().to_string()),
            image: spec.image,
        };
        check_room(&room)?;

        let _registration = self.registration.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists {
                entity: "room",
                id: room.id.to_string(),
            });
        }
        let event = Event::RoomRegistered { room: room.clone() };
        self.wal_append(&event).await?;
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        tracing::info!(room = %room.id, "registered room {:?}", room.name);
        Ok(room)
    }

    /// Changes apply to future requests only; existing bookings stay as they are.
    pub async fn update_room(&self, caller: &Caller, id: Ulid, patch: RoomPatch) -> Result<Room, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can update rooms"));
        }
        if patch == RoomPatch::default() {
            return Err(EngineError::invalid("nothing to update"));
        }
        let rs = self.get_room(&id).ok_or_else(|| EngineError::room_not_found(id))?;
        let mut guard = rs.write().await;

        let mut room = guard.room.clone();
        if let Some(name) = patch.name {
            room.name = name.trim().to_string();
        }
        if let Some(capacity) = patch.capacity {
            room.capacity = capacity_from(capacity)?;
        }
        if let Some(location) = patch.location {
            room.location = location;
        }
        if let Some(active) = patch.active {
            room.active = active;
        }
        if patch.open_time.is_some() || patch.close_time.is_some() {
            let open = patch.open_time.unwrap_or_else(|| room.hours.open_str());
            let close = patch.close_time.unwrap_or_else(|| room.hours.close_str());
            room.hours = OperatingHours::parse(&open, &close).map_err(EngineError::InvalidInput)?;
        }
        if let Some(timezone) = patch.timezone {
            room.timezone = timezone;
        }
        if let Some(image) = patch.image {
            room.image = image;
        }
        check_room(&room)?;

        let event = Event::RoomUpdated { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(room = %id, "updated room {:?}", room.name);
        Ok(room)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validator → conflict detector → store. New bookings start `pending`.
    pub async fn create_booking(&self, caller: &Caller, req: BookingRequest) -> Result<Booking, EngineError> {
        let fields = require_fields(&req)?;
        let room_id = parse_room_ref(fields.room_ref)?;
        let rs = self
            .get_room(&room_id)
            .ok_or_else(|| EngineError::room_not_found(room_id))?;
        let mut guard = rs.write().await;

        let now = now_ms();
        let (span, participants_count) = validate_slot(
            &guard.room,
            fields.start_raw,
            fields.end_raw,
            req.participants_count,
            now,
        )?;
        check_descriptive(
            Some(fields.activity_name),
            req.purpose.as_deref(),
            req.notes.as_deref(),
            req.contact_person.as_ref(),
            Some(req.equipment.as_slice()),
        )?;
        if let Some(upload) = &req.document {
            check_upload(upload)?;
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        check_no_conflict(&guard, &span, None, ConflictScope::AnyClaim)?;

        let activity_name = fields.activity_name.to_string();
        let booking = Booking {
            id: Ulid::new(),
            room_id,
            requester_id: caller.id,
            requester: Requester {
                name: caller.name.clone(),
                email: caller.email.clone(),
            },
            activity_name,
            purpose: non_blank(req.purpose),
            span,
            participants_count,
            notes: non_blank(req.notes),
            contact_person: req.contact_person,
            equipment: req.equipment,
            document_path: None,
            status: BookingStatus::Pending,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let booking = self.store_and_commit(&mut guard, booking, req.document).await?;

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking = %booking.id,
            room = %room_id,
            requester = %caller.id,
            "booking requested for {}..{}",
            format_ms(span.start),
            format_ms(span.end)
        );
        Ok(booking)
    }

    /// Attach the upload (if any), then persist the new booking. A document
    /// stored for a write that then fails is removed again.
    async fn store_and_commit(
        &self,
        rs: &mut RoomState,
        mut booking: Booking,
        upload: Option<Upload>,
    ) -> Result<Booking, EngineError> {
        if let Some(upload) = upload {
            booking.document_path = Some(self.documents.store(&upload).await.map_err(document_error)?);
        }
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(rs, &event).await {
            if let Some(path) = &booking.document_path {
                self.remove_document(path).await;
            }
            return Err(e);
        }
        Ok(booking)
    }

    /// Owner-only edit of a pending booking that has not started yet.
    ///
    /// A changed room or interval re-runs the whole slot pipeline against
    /// the target room, excluding the booking itself. A changed participant
    /// count alone re-checks capacity. Other fields are taken as given.
    pub async fn update_booking(
        &self,
        caller: &Caller,
        id: Ulid,
        mut patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::invalid("nothing to update"));
        }
        let target = patch.room_id.as_deref().map(parse_room_ref).transpose()?;
        let upload = patch.document.take();
        if let Some(upload) = &upload {
            check_upload(upload)?;
        }

        loop {
            let source = self
                .room_for_booking(&id)
                .ok_or_else(|| EngineError::booking_not_found(id))?;
            match target {
                Some(target) if target != source => {
                    let (mut src, mut dst) = self.lock_move(source, target).await?;
                    let Some(current) = src.booking(id).cloned() else {
                        continue;
                    };
                    let edited = edit_booking(caller, &current, &dst, &patch, now_ms())?;
                    return self
                        .commit_edit(current, edited, upload, &mut src, Some(&mut *dst))
                        .await;
                }
                _ => {
                    let rs = self
                        .get_room(&source)
                        .ok_or_else(|| EngineError::booking_not_found(id))?;
                    let mut guard = rs.write_owned().await;
                    let Some(current) = guard.booking(id).cloned() else {
                        if self.room_for_booking(&id) == Some(source) {
                            return Err(EngineError::booking_not_found(id));
                        }
                        continue;
                    };
                    let edited = edit_booking(caller, &current, &guard, &patch, now_ms())?;
                    return self.commit_edit(current, edited, upload, &mut guard, None).await;
                }
            }
        }
    }

    /// Write locks on both rooms of a move, taken in id order.
    async fn lock_move(&self, from: Ulid, to: Ulid) -> Result<(RoomGuard, RoomGuard), EngineError> {
        let src = self.get_room(&from).ok_or_else(|| EngineError::room_not_found(from))?;
        let dst = self.get_room(&to).ok_or_else(|| EngineError::room_not_found(to))?;
        if from < to {
            let s = src.write_owned().await;
            let d = dst.write_owned().await;
            Ok((s, d))
        } else {
            let d = dst.write_owned().await;
            let s = src.write_owned().await;
            Ok((s, d))
        }
    }

    async fn commit_edit(
        &self,
        current: Booking,
        mut edited: Booking,
        upload: Option<Upload>,
        src: &mut RoomState,
        dst: Option<&mut RoomState>,
    ) -> Result<Booking, EngineError> {
        if let Some(upload) = upload {
            edited.document_path = Some(self.documents.store(&upload).await.map_err(document_error)?);
        }
        let event = Event::BookingEdited {
            previous_room_id: current.room_id,
            booking: edited.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            if edited.document_path != current.document_path
                && let Some(path) = &edited.document_path
            {
                self.remove_document(path).await;
            }
            return Err(e);
        }
        apply_to_room(src, &event, &self.booking_to_room);
        if let Some(dst) = dst {
            apply_to_room(dst, &event, &self.booking_to_room);
        }

        if edited.document_path != current.document_path
            && let Some(old) = &current.document_path
        {
            self.remove_document(old).await;
        }
        tracing::info!(booking = %edited.id, room = %edited.room_id, "booking edited");
        Ok(edited)
    }

    /// Owner withdraws a pending or approved booking before it starts.
    pub async fn cancel_booking(
        &self,
        caller: &Caller,
        id: Ulid,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("note", note.as_deref(), MAX_NOTE_LEN)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;

        if !current.is_owned_by(caller) {
            return Err(EngineError::Forbidden("only the owner can cancel a booking"));
        }
        if transition_actor(current.status, BookingStatus::Cancelled) != Some(Actor::Owner) {
            return Err(EngineError::invalid_state(
                current.status,
                "only pending or approved bookings can be cancelled",
            ));
        }
        if current.span.start <= now_ms() {
            return Err(EngineError::invalid_state(current.status, "booking has already started"));
        }
        self.commit_transition(&mut guard, &current, BookingStatus::Cancelled, caller, note)
            .await
    }

    /// Administrator decision: approve, reject or complete.
    pub async fn set_status(
        &self,
        caller: &Caller,
        id: Ulid,
        target: BookingStatus,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only administrators can change booking status"));
        }
        if !matches!(
            target,
            BookingStatus::Approved | BookingStatus::Rejected | BookingStatus::Completed
        ) {
            return Err(EngineError::invalid(format!(
                "status must be approved, rejected or completed, not {target}"
            )));
        }
        check_text("note", note.as_deref(), MAX_NOTE_LEN)?;

        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;

        if transition_actor(current.status, target) != Some(Actor::Admin) {
            return Err(EngineError::invalid_state(
                current.status,
                format!("cannot change status from {} to {target}", current.status),
            ));
        }
        if target == BookingStatus::Approved {
            // Another request may have been approved since this one was made.
            check_no_conflict(&guard, &current.span, Some(id), ConflictScope::Confirmed)?;
        }
        self.commit_transition(&mut guard, &current, target, caller, note).await
    }

    /// Status and history move together in one event.
    async fn commit_transition(
        &self,
        rs: &mut RoomState,
        current: &Booking,
        to: BookingStatus,
        caller: &Caller,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        let change = StatusChange {
            actor: caller.id,
            from: current.status,
            to,
            note: non_blank(note),
            at: now_ms(),
        };
        let event = Event::BookingStatusChanged {
            id: current.id,
            room_id: current.room_id,
            change: change.clone(),
        };
        self.persist_and_apply(rs, &event).await?;
        let updated = rs
            .booking(current.id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("booking {} vanished under lock", current.id)))?;

        metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        tracing::info!(
            booking = %current.id,
            actor = %caller.id,
            "booking {} -> {}",
            change.from,
            change.to
        );
        self.dispatch_notice(StatusNotice::new(&updated, &change));
        Ok(updated)
    }

    /// Fire-and-forget. Delivery failures are logged and counted only.
    fn dispatch_notice(&self, notice: StatusNotice) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notice).await {
                metrics::counter!(NOTIFY_FAILURES_TOTAL).increment(1);
                tracing::warn!(booking = %notice.booking_id, "{e}");
            }
        });
    }

    /// Hard delete of a terminal booking by its owner or an administrator.
    pub async fn delete_booking(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;

        if !current.is_owned_by(caller) && !caller.is_admin() {
            return Err(EngineError::Forbidden("only the owner or an administrator can delete a booking"));
        }
        if !current.status.is_terminal() {
            return Err(EngineError::invalid_state(
                current.status,
                "only cancelled, rejected or completed bookings can be deleted",
            ));
        }
        let event = Event::BookingDeleted {
            id,
            room_id: current.room_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        if let Some(path) = &current.document_path {
            self.remove_document(path).await;
        }
        tracing::info!(booking = %id, actor = %caller.id, "booking deleted");
        Ok(())
    }

    async fn remove_document(&self, path: &str) {
        if let Err(e) = self.documents.remove(path).await {
            tracing::warn!("could not remove document {path}: {e}");
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Apply a patch to a pending booking, re-validating what the patch touches.
/// `target` is the room the booking ends up in.
fn edit_booking(
    caller: &Caller,
    current: &Booking,
    target: &RoomState,
    patch: &BookingPatch,
    now: Ms,
) -> Result<Booking, EngineError> {
    if !current.is_owned_by(caller) {
        return Err(EngineError::Forbidden("only the owner can edit a booking"));
    }
    if current.status != BookingStatus::Pending {
        return Err(EngineError::invalid_state(
            current.status,
            "only pending bookings can be edited",
        ));
    }
    if current.span.start <= now {
        return Err(EngineError::invalid_state(current.status, "booking has already started"));
    }
    check_descriptive(
        patch.activity_name.as_deref(),
        patch.purpose.as_ref().and_then(|p| p.as_deref()),
        patch.notes.as_ref().and_then(|n| n.as_deref()),
        patch.contact_person.as_ref().and_then(|c| c.as_ref()),
        patch.equipment.as_deref(),
    )?;

    let room = &target.room;
    let start = match &patch.start_time {
        Some(raw) => parse_instant(raw).map_err(EngineError::InvalidInput)?,
        None => current.span.start,
    };
    let end = match &patch.end_time {
        Some(raw) => parse_instant(raw).map_err(EngineError::InvalidInput)?,
        None => current.span.end,
    };
    let current_count = current.participants_count.map(i64::from);
    let count = patch.participants_count.unwrap_or(current_count);

    let slot_changed = room.id != current.room_id || start != current.span.start || end != current.span.end;
    let (span, participants_count) = if slot_changed {
        check_room_bookable(room)?;
        let span = interval_from(start, end, now)?;
        let participants = check_participants(room, count)?;
        check_operating_hours(room, &span)?;
        check_no_conflict(target, &span, Some(current.id), ConflictScope::AnyClaim)?;
        (span, participants)
    } else if count != current_count {
        (current.span, check_participants(room, count)?)
    } else {
        (current.span, current.participants_count)
    };

    let mut edited = current.clone();
    edited.room_id = room.id;
    edited.span = span;
    edited.participants_count = participants_count;
    if let Some(name) = &patch.activity_name {
        edited.activity_name = name.trim().to_string();
    }
    if let Some(purpose) = &patch.purpose {
        edited.purpose = non_blank(purpose.clone());
    }
    if let Some(notes) = &patch.notes {
        edited.notes = non_blank(notes.clone());
    }
    if let Some(contact) = &patch.contact_person {
        edited.contact_person = contact.clone();
    }
    if let Some(equipment) = &patch.equipment {
        edited.equipment = equipment.clone();
    }
    edited.updated_at = now;
    Ok(edited)
}
