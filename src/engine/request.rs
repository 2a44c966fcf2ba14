use std::str::FromStr;

use ulid::Ulid;

use crate::documents::Upload;
use crate::limits::*;
use crate::model::*;

/// A new booking as the client supplied it. Ids and timestamps stay raw so the
/// validator decides how malformed input is reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingRequest {
    pub room_id: Option<String>,
    pub activity_name: Option<String>,
    pub purpose: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub participants_count: Option<i64>,
    pub notes: Option<String>,
    pub contact_person: Option<ContactPerson>,
    pub equipment: Vec<String>,
    pub document: Option<Upload>,
}

/// Field-level edit of a pending booking. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub room_id: Option<String>,
    pub activity_name: Option<String>,
    pub purpose: Option<Option<String>>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub participants_count: Option<Option<i64>>,
    pub notes: Option<Option<String>>,
    pub contact_person: Option<Option<ContactPerson>>,
    pub equipment: Option<Vec<String>>,
    pub document: Option<Upload>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == BookingPatch::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSpec {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub location: Option<String>,
    pub active: Option<bool>,
    pub open_time: Option<String>,
    pub close_time: Option<String>,
    pub timezone: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub location: Option<Option<String>>,
    pub active: Option<bool>,
    pub open_time: Option<String>,
    pub close_time: Option<String>,
    pub timezone: Option<String>,
    pub image: Option<Option<String>>,
}

// ── Listing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    StartTime,
    EndTime,
    ActivityName,
    Status,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created_at" => Ok(SortField::CreatedAt),
            "updated_at" => Ok(SortField::UpdatedAt),
            "start_time" => Ok(SortField::StartTime),
            "end_time" => Ok(SortField::EndTime),
            "activity_name" => Ok(SortField::ActivityName),
            "status" => Ok(SortField::Status),
            other => Err(format!("cannot sort by {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingQuery {
    pub status: Option<BookingStatus>,
    pub room_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    /// Bookings starting at or after this instant.
    pub from: Option<Ms>,
    /// Bookings ending at or before this instant.
    pub to: Option<Ms>,
    pub search: Option<String>,
    pub sort: SortField,
    pub descending: bool,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

impl Default for BookingQuery {
    fn default() -> Self {
        Self {
            status: None,
            room_id: None,
            user_id: None,
            from: None,
            to: None,
            search: None,
            sort: SortField::CreatedAt,
            descending: true,
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Year,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            other => Err(format!("unknown period {other} (expected week, month or year)")),
        }
    }
}
