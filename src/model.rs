use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only stored time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Render a stored instant as an RFC 3339 UTC timestamp.
pub fn format_ms(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Pending,
        BookingStatus::Approved,
        BookingStatus::Rejected,
        BookingStatus::Cancelled,
        BookingStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Rejected, cancelled and completed bookings only accept deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Completed
        )
    }

    /// Whether a booking in this status still claims its room interval.
    pub fn occupies_room(&self) -> bool {
        !matches!(self, BookingStatus::Rejected | BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Authenticated identity behind one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Rooms ────────────────────────────────────────────────────────

/// Daily bookable window, in minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: u16,
    pub close: u16,
}

impl Default for OperatingHours {
    fn default() -> Self {
        Self {
            open: 8 * 60,
            close: 17 * 60,
        }
    }
}

impl OperatingHours {
    pub fn parse(open: &str, close: &str) -> Result<Self, String> {
        let open = parse_hhmm(open)?;
        let close = parse_hhmm(close)?;
        if open >= close {
            return Err(format!(
                "operating hours open {} must be before close {}",
                fmt_hhmm(open),
                fmt_hhmm(close)
            ));
        }
        Ok(Self { open, close })
    }

    /// Inclusive at both ends: a booking may start at `open` and end at `close`.
    pub fn contains(&self, t: NaiveTime) -> bool {
        let secs = t.num_seconds_from_midnight();
        u32::from(self.open) * 60 <= secs && secs <= u32::from(self.close) * 60
    }

    pub fn open_str(&self) -> String {
        fmt_hhmm(self.open)
    }

    pub fn close_str(&self) -> String {
        fmt_hhmm(self.close)
    }
}

/// "HH:MM" → minutes since midnight. "24:00" is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Result<u16, String> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
    let h: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
    let m: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(format!("time of day out of range: {s:?}"));
    }
    Ok(h * 60 + m)
}

pub fn fmt_hhmm(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub active: bool,
    pub hours: OperatingHours,
    /// IANA zone name the operating hours are expressed in.
    pub timezone: String,
    pub image: Option<String>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPerson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// One entry of a booking's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub actor: Ulid,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub note: Option<String>,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub requester: Requester,
    pub activity_name: String,
    pub purpose: Option<String>,
    pub span: Span,
    pub participants_count: Option<u32>,
    pub notes: Option<String>,
    pub contact_person: Option<ContactPerson>,
    pub equipment: Vec<String>,
    pub document_path: Option<String>,
    pub status: BookingStatus,
    pub history: Vec<StatusChange>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// The most recent status change, if the booking ever left `pending`.
    pub fn latest_change(&self) -> Option<&StatusChange> {
        self.history.last()
    }

    pub fn is_owned_by(&self, caller: &Caller) -> bool {
        self.requester_id == caller.id
    }

    pub fn summary(&self) -> ConflictSummary {
        ConflictSummary {
            id: self.id,
            activity_name: self.activity_name.clone(),
            start: format_ms(self.span.start),
            end: format_ms(self.span.end),
            status: self.status,
        }
    }
}

/// The colliding booking reported back to a refused caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictSummary {
    pub id: Ulid,
    pub activity_name: String,
    pub start: String,
    pub end: String,
    pub status: BookingStatus,
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Every booking on the room regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement; `previous_room_id` differs from `booking.room_id` on a move.
    BookingEdited {
        previous_room_id: Ulid,
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        change: StatusChange,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}
