use ulid::Ulid;

use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;

use super::EngineError;

/// Which existing bookings claim their interval for a given check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictScope {
    /// Every booking that still occupies the room: pending, approved, completed.
    AnyClaim,
    /// Only bookings an administrator has confirmed. Used at approval time,
    /// where other pending requests must not block the one being approved.
    Confirmed,
}

impl ConflictScope {
    fn blocks(self, status: BookingStatus) -> bool {
        match self {
            ConflictScope::AnyClaim => status.occupies_room(),
            ConflictScope::Confirmed => {
                matches!(status, BookingStatus::Approved | BookingStatus::Completed)
            }
        }
    }
}

/// First booking on the room, other than `exclude`, whose interval overlaps `span`.
pub fn find_conflict<'a>(
    rs: &'a RoomState,
    span: &Span,
    exclude: Option<Ulid>,
    scope: ConflictScope,
) -> Option<&'a Booking> {
    rs.overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| scope.blocks(b.status))
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
    scope: ConflictScope,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude, scope) {
        Some(existing) => {
            metrics::counter!(CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                room = %rs.room.id,
                existing = %existing.id,
                "slot {}..{} already taken",
                format_ms(span.start),
                format_ms(span.end)
            );
            Err(EngineError::Conflict(Box::new(existing.summary())))
        }
        None => Ok(()),
    }
}
