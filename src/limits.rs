use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single booking may not run longer than 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * DAY_MS;

pub const MAX_ROOM_NAME_LEN: usize = 200;
pub const MAX_ACTIVITY_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 4_000;
pub const MAX_EQUIPMENT_ITEMS: usize = 50;
pub const MAX_EQUIPMENT_ITEM_LEN: usize = 100;
pub const MAX_NOTE_LEN: usize = 1_000;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

pub const DEFAULT_UPCOMING_DAYS: u32 = 7;
pub const MAX_UPCOMING_DAYS: u32 = 366;

pub const TOP_ROOMS: usize = 5;

pub const MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_DOCUMENT_NAME_LEN: usize = 255;
