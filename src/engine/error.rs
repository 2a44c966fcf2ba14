use crate::model::{BookingStatus, ConflictSummary};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("participants count {requested} exceeds room capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    #[error("booking must lie within operating hours {open}-{close} ({timezone})")]
    OutOfOperatingHours {
        open: String,
        close: String,
        timezone: String,
    },

    #[error(
        "room already booked for \"{}\" from {} to {}",
        .0.activity_name, .0.start, .0.end
    )]
    Conflict(Box<ConflictSummary>),

    #[error("booking is {current}: {reason}")]
    InvalidState {
        current: BookingStatus,
        reason: String,
    },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn booking_not_found(id: impl ToString) -> Self {
        EngineError::NotFound {
            entity: "booking",
            id: id.to_string(),
        }
    }

    pub(crate) fn room_not_found(id: impl ToString) -> Self {
        EngineError::NotFound {
            entity: "room",
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    pub(crate) fn invalid_state(current: BookingStatus, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            current,
            reason: reason.into(),
        }
    }
}
