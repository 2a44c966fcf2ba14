//! Booking validation. Every check here is a pure function of its inputs;
//! the caller supplies the room state and the current instant.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::documents::Upload;
use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::request::BookingRequest;

/// The fields a booking cannot be created without, borrowed from the request.
#[derive(Debug)]
pub(crate) struct RequiredFields<'a> {
    pub room_ref: &'a str,
    pub activity_name: &'a str,
    pub start_raw: &'a str,
    pub end_raw: &'a str,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Step 1: room reference, activity name, start and end must all be present.
pub(crate) fn require_fields(req: &BookingRequest) -> Result<RequiredFields<'_>, EngineError> {
    let mut missing = Vec::new();
    let room_ref = present(&req.room_id);
    let activity_name = present(&req.activity_name);
    let start_raw = present(&req.start_time);
    let end_raw = present(&req.end_time);
    if room_ref.is_none() {
        missing.push("room_id");
    }
    if activity_name.is_none() {
        missing.push("activity_name");
    }
    if start_raw.is_none() {
        missing.push("start_time");
    }
    if end_raw.is_none() {
        missing.push("end_time");
    }
    match (room_ref, activity_name, start_raw, end_raw) {
        (Some(room_ref), Some(activity_name), Some(start_raw), Some(end_raw)) => Ok(RequiredFields {
            room_ref,
            activity_name,
            start_raw,
            end_raw,
        }),
        _ => Err(EngineError::invalid(format!(
            "missing required fields: {}",
            missing.join(", ")
        ))),
    }
}

pub(crate) fn check_text(field: &'static str, value: Option<&str>, max: usize) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::invalid(format!(
            "{field} is longer than {max} bytes"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn check_equipment(items: &[String]) -> Result<(), EngineError> {
    if items.len() > MAX_EQUIPMENT_ITEMS {
        return Err(EngineError::invalid(format!(
            "at most {MAX_EQUIPMENT_ITEMS} equipment items"
        )));
    }
    for item in items {
        check_text("equipment item", Some(item), MAX_EQUIPMENT_ITEM_LEN)?;
    }
    Ok(())
}

/// Length limits on the free-form booking fields that are present.
pub(crate) fn check_descriptive(
    activity_name: Option<&str>,
    purpose: Option<&str>,
    notes: Option<&str>,
    contact: Option<&ContactPerson>,
    equipment: Option<&[String]>,
) -> Result<(), EngineError> {
    if let Some(name) = activity_name
        && name.trim().is_empty()
    {
        return Err(EngineError::invalid("activity_name cannot be empty"));
    }
    check_text("activity_name", activity_name, MAX_ACTIVITY_NAME_LEN)?;
    check_text("purpose", purpose, MAX_TEXT_LEN)?;
    check_text("notes", notes, MAX_TEXT_LEN)?;
    if let Some(c) = contact {
        check_text("contact_person name", c.name.as_deref(), MAX_ROOM_NAME_LEN)?;
        check_text("contact_person phone", c.phone.as_deref(), MAX_EQUIPMENT_ITEM_LEN)?;
        check_text("contact_person email", c.email.as_deref(), MAX_ROOM_NAME_LEN)?;
    }
    if let Some(items) = equipment {
        check_equipment(items)?;
    }
    Ok(())
}

pub(crate) fn check_upload(upload: &Upload) -> Result<(), EngineError> {
    check_text("document_name", Some(upload.file_name.as_str()), MAX_DOCUMENT_NAME_LEN)?;
    if upload.bytes.is_empty() {
        return Err(EngineError::invalid("document is empty"));
    }
    if upload.bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(EngineError::invalid(format!(
            "document is larger than {MAX_DOCUMENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Malformed room references are indistinguishable from unknown rooms.
pub(crate) fn parse_room_ref(raw: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw.trim()).map_err(|_| EngineError::room_not_found(raw.trim()))
}

/// Step 2 (after lookup): only active rooms take new bookings.
pub(crate) fn check_room_bookable(room: &Room) -> Result<(), EngineError> {
    if room.active {
        Ok(())
    } else {
        Err(EngineError::room_not_found(room.id))
    }
}

/// Accepts RFC 3339 (`2030-05-01T09:00:00+07:00`) or integer unix milliseconds.
pub fn parse_instant(raw: &str) -> Result<Ms, String> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Steps 3 to 5: both ends parse, end after start, start not in the past.
pub(crate) fn check_interval(start_raw: &str, end_raw: &str, now: Ms) -> Result<Span, EngineError> {
    let start = parse_instant(start_raw).map_err(EngineError::InvalidInput)?;
    let end = parse_instant(end_raw).map_err(EngineError::InvalidInput)?;
    interval_from(start, end, now)
}

pub(crate) fn interval_from(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::invalid("timestamp out of range"));
    }
    if end <= start {
        return Err(EngineError::invalid("end_time must be after start_time"));
    }
    if start < now {
        return Err(EngineError::invalid("cannot book the past"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::invalid("booking is too long"));
    }
    Ok(span)
}

/// Step 6: a given participant count is positive and fits the room.
pub(crate) fn check_participants(room: &Room, count: Option<i64>) -> Result<Option<u32>, EngineError> {
    let Some(count) = count else { return Ok(None) };
    if count <= 0 {
        return Err(EngineError::invalid("participants_count must be positive"));
    }
    let requested = u32::try_from(count).unwrap_or(u32::MAX);
    if requested > room.capacity {
        return Err(EngineError::CapacityExceeded {
            requested,
            capacity: room.capacity,
        });
    }
    Ok(Some(requested))
}

pub(crate) fn room_tz(room: &Room) -> Result<Tz, EngineError> {
    room.timezone.parse::<Tz>().map_err(|_| {
        EngineError::Internal(format!("room {} has unknown time zone {}", room.id, room.timezone))
    })
}

/// Step 7: a booking on a single local calendar day must sit inside the
/// room's operating hours. Bookings crossing midnight are exempt.
pub(crate) fn check_operating_hours(room: &Room, span: &Span) -> Result<(), EngineError> {
    let tz = room_tz(room)?;
    let local = |ms: Ms| {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .map(|dt| dt.with_timezone(&tz))
            .ok_or_else(|| EngineError::invalid("timestamp out of range"))
    };
    let start = local(span.start)?;
    let end = local(span.end)?;
    if start.date_naive() != end.date_naive() {
        return Ok(());
    }
    if room.hours.contains(start.time()) && room.hours.contains(end.time()) {
        Ok(())
    } else {
        Err(EngineError::OutOfOperatingHours {
            open: room.hours.open_str(),
            close: room.hours.close_str(),
            timezone: room.timezone.clone(),
        })
    }
}

/// Steps 2 to 7 against a resolved room, in order.
pub(crate) fn validate_slot(
    room: &Room,
    start_raw: &str,
    end_raw: &str,
    participants: Option<i64>,
    now: Ms,
) -> Result<(Span, Option<u32>), EngineError> {
    check_room_bookable(room)?;
    let span = check_interval(start_raw, end_raw, now)?;
    let participants = check_participants(room, participants)?;
    check_operating_hours(room, &span)?;
    Ok((span, participants))
}
